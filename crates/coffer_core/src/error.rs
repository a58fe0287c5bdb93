//! Error types for Coffer core.

use thiserror::Error;
use uuid::Uuid;

use crate::record::EntityKind;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Coffer core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Local storage backend error.
    ///
    /// Disk and quota failures surface here and are fatal to the current
    /// operation only; they are never swallowed, since a lost write would
    /// desynchronize `pending_sync` bookkeeping from the stored state.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Field map (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found.
    #[error("record not found: {id} in {kind}")]
    RecordNotFound {
        /// The table searched.
        kind: EntityKind,
        /// The record id that was not found.
        id: Uuid,
    },

    /// Stored data could not be interpreted.
    #[error("invalid stored data: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Invalid key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {message}")]
    KeyDerivationFailed {
        /// Description of the failure.
        message: String,
    },

    /// The key provider has no unlocked key available.
    #[error("encryption key unavailable")]
    KeyUnavailable,
}

impl CoreError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an encryption failure error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption failure error.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Creates a key derivation failure error.
    pub fn key_derivation_failed(message: impl Into<String>) -> Self {
        Self::KeyDerivationFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::RecordNotFound {
            kind: EntityKind::Category,
            id: Uuid::nil(),
        };
        assert!(err.to_string().contains("categories"));

        let err = CoreError::invalid_key_size(16, 32);
        assert!(err.to_string().contains("expected 32"));
        assert!(err.to_string().contains("got 16"));
    }
}
