//! Error types for the agent crate.

use codex::LLMError;

/// Errors surfaced by backend file and command operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("path escapes working directory: {0}")]
    PathEscape(String),
    #[error("command timed out after {0}s")]
    Timeout(u64),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Top-level agent error.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LLMError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("session error: {0}")]
    Session(String),
    #[error("planning failed: {0}")]
    Planning(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}
