//! Sync engine error types.
//!
//! The taxonomy drives run control flow: only `Auth` and `Connection` abort
//! a run; `Validation` and exhausted `Transient` failures are recorded
//! per-entity and the run continues; `RateLimited` pauses the run for the
//! hinted duration and is never counted as an entity error.

use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("a sync run is already active for this scope: {0}")]
    RunInProgress(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Store(#[from] ledgerlink_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Fatal errors abort the whole run; everything else is caught and
    /// accumulated per entity.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Auth(_) | SyncError::Connection(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::RateLimited { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            SyncError::Transient(e.to_string())
        } else if e.is_decode() {
            SyncError::Validation(format!("malformed response: {e}"))
        } else {
            SyncError::Transient(e.to_string())
        }
    }
}
