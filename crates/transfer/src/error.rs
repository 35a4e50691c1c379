//! Error types for the transfer engine.

use crate::types::{TransferId, TransferState};
use crate::validation::ValidationError;

/// Structured failure reported by a [`StorageClient`](crate::StorageClient).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("access denied: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Returns `true` for failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The input stream could not be materialised into a local file.
    #[error("staging failed: {0}")]
    Staging(#[source] std::io::Error),

    /// Transient network failures outlasted the retry ceiling.
    #[error("network error after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("access denied: {0}")]
    AuthOrPermission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: TransferState,
        to: TransferState,
    },

    #[error("transfer {id} is already {state}")]
    AlreadyTerminal { id: TransferId, state: TransferState },

    #[error("unknown transfer: {0}")]
    UnknownTransfer(TransferId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record store error: {0}")]
    Store(String),

    #[error("transfer manager is shut down")]
    ShutDown,
}

impl TransferError {
    /// Maps a storage failure observed on the `attempts`-th try.
    pub fn from_storage(err: StorageError, attempts: u32) -> Self {
        match err {
            StorageError::Network(message) => Self::TransientNetwork { attempts, message },
            StorageError::Timeout => Self::TransientNetwork {
                attempts,
                message: "request timed out".into(),
            },
            StorageError::Auth(msg) => Self::AuthOrPermission(msg),
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::PreconditionFailed(msg) => Self::PreconditionFailed(msg),
            StorageError::Other(msg) => Self::Storage(msg),
        }
    }

    /// Returns `true` when resuming the transfer may succeed without any
    /// change on the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. } | Self::Io(_))
    }

    /// Returns `true` for usage errors reported to the caller of
    /// pause/resume/cancel rather than through the observer channel.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStateTransition { .. }
                | Self::AlreadyTerminal { .. }
                | Self::UnknownTransfer(_)
                | Self::Validation(_)
        )
    }
}
