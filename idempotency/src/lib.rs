//! Idempotency Guard
//!
//! Makes a mutating request exactly-once-effective: the first request with a
//! given `(tenant, endpoint, key)` runs its handler, later identical requests
//! replay the stored response byte for byte, and a key reused for a different
//! request is rejected.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod guard;
pub mod key;
pub mod metrics;

// Re-exports
pub use config::IdempotencyConfig;
pub use error::{Error, Result};
pub use guard::{Executed, IdempotencyGuard, IdempotencyRecord, RecordStatus};
pub use key::{fingerprint, IdempotencyKey, Scope};
