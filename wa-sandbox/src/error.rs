use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The request itself is unacceptable: bad path, unknown asset, missing
    /// argument, non-SELECT query. Raised before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The request was acceptable but carrying it out failed.
    #[error("execution failed: {0}")]
    Execution(String),
}

impl SandboxError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Stable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Execution(_) => "execution_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation(m) | Self::Execution(m) => m,
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        Self::Execution(format!("io error: {e}"))
    }
}

impl From<rusqlite::Error> for SandboxError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Execution(format!("database error: {e}"))
    }
}

impl From<tokio::task::JoinError> for SandboxError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Execution(format!("blocking task failed: {e}"))
    }
}
