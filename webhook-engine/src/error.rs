//! Error types for the webhook engine

use thiserror::Error;
use uuid::Uuid;

/// Result type for webhook operations
pub type Result<T> = std::result::Result<T, Error>;

/// Webhook engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage layer failure
    #[error("Storage error: {0}")]
    Storage(#[from] ledger_core::Error),

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Subscription rejected at registration
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Unknown subscription
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    /// Unknown delivery
    #[error("Delivery not found: {0}")]
    DeliveryNotFound(Uuid),

    /// Network or client failure while posting
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
