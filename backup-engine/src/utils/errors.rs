//! Error taxonomy shared by every engine component.
//!
//! Collaborator adapters map their failures onto these variants; the worker
//! and orchestrators decide retry and attribution from the variant alone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed cron expression, retention policy or request. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure, timeout or rate limit. Retried with capped backoff.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Authorization, quota or any other failure that will not heal by retrying.
    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The status store rejected or failed a read/write.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Serializable classification of an [`EngineError`], kept on outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Config,
    Transient,
    Permanent,
    NotFound,
    Store,
    Cancelled,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::Permanent(_) => ErrorKind::Permanent,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Store(_) => ErrorKind::Store,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Store(format!("serialization failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
