//! Error types for the idempotency guard

use thiserror::Error;

/// Result type for idempotency operations
pub type Result<T> = std::result::Result<T, Error>;

/// Idempotency guard errors
#[derive(Error, Debug)]
pub enum Error {
    /// Key malformed
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    /// Same key reused with a different request body
    #[error("Idempotency key {key} was already used for a different request")]
    IdempotencyConflict {
        /// The reused key
        key: String,
    },

    /// A request with this key is still executing
    #[error("Request with idempotency key {key} is still in progress")]
    ConflictInProgress {
        /// The in-flight key
        key: String,
    },

    /// Response could not be snapshotted or replayed
    #[error("Snapshot serialization error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Storage layer failure
    #[error("Storage error: {0}")]
    Storage(#[from] ledger_core::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Client may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConflictInProgress { .. })
    }
}
