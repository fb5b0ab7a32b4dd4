//! Store error model.
//!
//! sqlx errors are mapped at this boundary and never leak above it:
//!
//! | sqlx error | StoreError | Scenario |
//! |---|---|---|
//! | `RowNotFound` | `NotFound` | Target id absent |
//! | Database, unique violation | `Conflict` | Lost insert race |
//! | Database, serialization failure | `Conflict` | Lost compare-and-set |
//! | Pool / IO / other | `Unavailable` | Store down or timed out |

use thiserror::Error;

use conductor_core::CoreError;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional update matched zero rows.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The target id is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store is unreachable or timed out; retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row failed to decode; indicates schema drift.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(e.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => CoreError::Conflict(msg),
            StoreError::NotFound(msg) => CoreError::NotFound(msg),
            StoreError::Unavailable(msg) => CoreError::Unavailable(msg),
            StoreError::Corrupt(msg) => CoreError::Internal(msg),
        }
    }
}
