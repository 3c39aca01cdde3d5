use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, StreamChunk};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// A model backend. Each call to [`CompletionProvider::stream`] starts a fresh
/// model turn over the full conversation and yields chunks until the turn ends.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream>;
}

/// Validates a tool name against the strictest common provider constraint:
/// `^[A-Za-z0-9_-]{1,64}$`.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LlmError::InvalidInput("tool name is empty".to_string()));
    }
    if name.len() > 64 {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} exceeds 64 characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}
