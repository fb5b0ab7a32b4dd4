//! Error model shared by the orchestrator components.
//!
//! Every variant is a *kind* in the sense of the HTTP error contract: the API
//! layer maps kinds to status codes and background loops use them to decide
//! whether to retry. Infrastructure errors are converted into `Unavailable`
//! or `Internal` at the store boundary; nothing below the API surfaces a raw
//! driver error.

use thiserror::Error;

/// Result type used across the orchestrator.
pub type CoreResult<T> = Result<T, CoreError>;

/// Orchestrator-level error, tagged by kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bad input shape. Surfaced as 400; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal transition or lost compare-and-set. Surfaced as 409; the
    /// caller may retry on a fresh read.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing id. Surfaced as 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Store I/O failure or timeout. Surfaced as 503 after the internal
    /// retry budget is exhausted.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Unexpected failure. Surfaced as 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable kind tag used in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::Conflict(_) => "conflict",
            CoreError::NotFound(_) => "not_found",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::Internal(_) => "internal",
        }
    }
}
