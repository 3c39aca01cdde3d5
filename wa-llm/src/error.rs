use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Everything that can go wrong between us and the completion provider.
/// Sessions surface all of these as a single provider failure.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    ResponseFormat(String),

    #[error("malformed stream: {0}")]
    StreamParse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unreachable(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
