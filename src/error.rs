//! Error taxonomy for the offline store and sync engine.
//!
//! `Storage` failures are fatal to the operation that hit them and bubble to
//! the caller unchanged; `Network` and `Timeout` are transient and retried
//! with backoff by the sync engine; `Rejected` is a semantic 4xx rejection
//! that is surfaced for manual correction instead of retried.

use thiserror::Error;

/// Errors produced by the offline store, the remote backend client, and the
/// sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Device persistence is unavailable or corrupt (quota, permissions,
    /// poisoned handle). Never retried automatically.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transient failure reaching the remote backend.
    #[error("network error: {0}")]
    Network(String),

    /// A remote call exceeded its bounded wait. Retried like a network
    /// failure.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The remote rejected the payload (validation failure, unknown entity).
    /// Retrying the same payload will not help.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// Locally supplied input failed validation before anything was stored.
    #[error("invalid input: {0}")]
    Invalid(String),
}

impl SyncError {
    /// Whether the sync engine should retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Network("connection refused".into()).is_retryable());
        assert!(SyncError::Timeout("10s elapsed".into()).is_retryable());
        assert!(!SyncError::Rejected("invalid menu item".into()).is_retryable());
        assert!(!SyncError::Storage("disk full".into()).is_retryable());
        assert!(!SyncError::Invalid("empty order".into()).is_retryable());
    }
}
