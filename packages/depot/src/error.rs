// Error taxonomy shared by the pipeline, the service and the HTTP surface
use std::io;

use crate::storage::StoreError;

pub type Result<T> = std::result::Result<T, DepotError>;

#[derive(Debug, thiserror::Error)]
pub enum DepotError {
    /// Bad input: filename, blocked extension, malformed identity
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("payload exceeds the maximum allowed size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    /// Lost a race on an identity or digest; safe to retry
    #[error("conflict: {0}")]
    Conflict(String),

    /// Object store or metadata store unreachable after retries
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Object store refused the operation outright
    #[error("backend rejected the request: {0}")]
    BackendRejected(String),

    /// The configured backend cannot do this
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Stream read or write failure, not retried
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DepotError {
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("file {}", id))
    }

    /// Whether a client can reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::BackendUnavailable(_))
    }
}

impl From<sqlx::Error> for DepotError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::BackendUnavailable(format!("metadata store: {}", err))
            }
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            other => Self::Internal(format!("metadata store: {}", other)),
        }
    }
}

impl From<StoreError> for DepotError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(format!("object {}", key)),
            StoreError::Transient(msg) => Self::BackendUnavailable(msg),
            StoreError::Permanent(msg) => Self::BackendRejected(msg),
            StoreError::Io(e) => Self::Io(e),
        }
    }
}
