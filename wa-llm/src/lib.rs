//! Conversation model and completion-provider plumbing for wpagent.
//!
//! Pure HTTP client, no knowledge of WordPress or the sandbox.

mod error;
mod openai;
mod provider;
mod types;

pub use error::{LlmError, Result};
pub use openai::{DEFAULT_BASE_URL, OpenAiCompatProvider};
pub use provider::{ChunkStream, CompletionProvider, validate_tool_name};
pub use types::{
    CompletionRequest, Message, Part, ProposedAction, Role, StreamChunk, ToolDefinition, Usage,
};
