//! Error types for the ledger

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (backend failure)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Amount was zero or negative
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Pool cannot cover the requested reservation
    #[error("Insufficient pool credits: requested {requested}, available {available}")]
    InsufficientPoolCredits {
        /// Credits requested
        requested: u64,
        /// Credits available (balance minus outstanding holds)
        available: Decimal,
    },

    /// A reservation already exists for this payment reference
    #[error("Reservation already exists for payment {0}")]
    ReservationExists(String),

    /// No reservation for this payment reference
    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    /// Reservation is not in a state that allows the requested operation
    #[error("Reservation {payment_ref} is {status}, cannot {operation}")]
    InvalidReservationState {
        /// Payment reference
        payment_ref: String,
        /// Current status
        status: String,
        /// Attempted operation
        operation: &'static str,
    },

    /// Debit would leave the pool unable to cover its outstanding holds
    #[error("Pool balance {balance} minus {amount} would fall below reserved {reserved}")]
    PoolBalanceBelowReservations {
        /// Pool balance before the debit
        balance: Decimal,
        /// Debit amount
        amount: Decimal,
        /// Credits held by active reservations
        reserved: Decimal,
    },

    /// Invariant violation (conservation, pool overcommit)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed pagination cursor
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
