//! Error types for the sync engine.

use coffer_core::CoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network failure talking to the remote authority.
    ///
    /// Aborts the current cycle without touching any `pending_sync` flags;
    /// the caller re-triggers on the next connectivity event or timer.
    #[error("network failure: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the cycle can be retried.
        retryable: bool,
    },

    /// Local store error during sync.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// The cycle was cancelled between records.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network { retryable: true, .. })
    }
}
