//! Error taxonomy for the sync engine.
//!
//! Most low-level failures never reach callers as errors: a failed liveness
//! probe flips the connectivity state, and a failed remote apply lands in the
//! outbox row's `last_error` column. The variants here are what the public
//! API surfaces once those conversions have happened.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The server answered and explicitly refused the mutation. The
    /// optimistic local state is not reverted automatically.
    #[error("remote rejected the change: {0}")]
    RemoteRejection(String),

    /// The request never completed: connection refused, timeout, TLS or DNS
    /// failure. Retried on the next drain.
    #[error("transport error: {0}")]
    Transport(String),

    /// The durable local store is unavailable or returned an error. Offline
    /// lookups degrade to not-found; queue appends propagate this.
    #[error("local store error: {0}")]
    Storage(String),

    /// A drain pass finished but left failed changes behind.
    #[error("{failed} change(s) failed to sync")]
    DrainIncomplete { failed: usize },
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl SyncError {
    /// True for failures that a later drain can reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_incomplete_message() {
        let err = SyncError::DrainIncomplete { failed: 3 };
        assert_eq!(err.to_string(), "3 change(s) failed to sync");
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(SyncError::Transport("timed out".into()).is_retryable());
        assert!(!SyncError::RemoteRejection("conflict".into()).is_retryable());
        assert!(!SyncError::Storage("disk full".into()).is_retryable());
    }
}
