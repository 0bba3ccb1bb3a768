//! Error types for the document engine

use crate::types::DocumentStatus;
use ledger_core::TenantId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for document operations
pub type Result<T> = std::result::Result<T, Error>;

/// Document engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Idempotency guard rejected the request
    #[error("Idempotency error: {0}")]
    Idempotency(#[from] idempotency::Error),

    /// Webhook engine error
    #[error("Webhook error: {0}")]
    Webhook(#[from] webhook_engine::Error),

    /// Unknown document
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// Unknown dead letter
    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(Uuid),

    /// Guarded transition saw a different status
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Status found
        from: DocumentStatus,
        /// Status requested
        to: DocumentStatus,
    },

    /// Operation collides with concurrent work on the same document
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Daily or monthly document limit reached with `limit_action = block`
    #[error("Document limit exceeded for tenant {tenant_id}: {period} limit {limit}")]
    DocumentLimitExceeded {
        /// Tenant
        tenant_id: TenantId,
        /// `daily` or `monthly`
        period: &'static str,
        /// Configured limit
        limit: u32,
    },

    /// Payload rejected
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dead letter cannot be requeued for this work type
    #[error("Retry not supported for document {document_id}: {reason}")]
    RetryNotSupported {
        /// Document
        document_id: Uuid,
        /// Why
        reason: String,
    },

    /// Provider gateway setup failure
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Maps to a client-visible conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::InvalidStateTransition { .. }
                | Error::Conflict(_)
                | Error::Idempotency(idempotency::Error::IdempotencyConflict { .. })
                | Error::Idempotency(idempotency::Error::ConflictInProgress { .. })
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Gateway(err.to_string())
    }
}
