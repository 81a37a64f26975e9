//! # Backend Errors

use thiserror::Error;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Provisioning backend errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend {backend} failed to start instance: {reason}")]
    StartFailed { backend: String, reason: String },

    #[error("Backend {backend} failed to stop instance: {reason}")]
    StopFailed { backend: String, reason: String },

    #[error("Backend {backend} timed out after {after_ms}ms")]
    Timeout { backend: String, after_ms: u64 },

    #[error("Backend {0} is at capacity")]
    AtCapacity(String),

    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::StartFailed { .. }
            | BackendError::StopFailed { .. }
            | BackendError::Timeout { .. }
            | BackendError::AtCapacity(_) => true,
            BackendError::UnknownInstance(_) | BackendError::Internal(_) => false,
        }
    }
}
