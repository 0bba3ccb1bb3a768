//! Ledger Core
//!
//! Wallet settlement engine: append-only ledger entries with cached balances,
//! low-balance hooks, and pool credit reservations.
//!
//! # Architecture
//!
//! - **Entries are the source of truth**: every wallet mutation writes one
//!   immutable entry; the cached balance is their running sum
//! - **Single Writer**: one logical writer task serializes every wallet and
//!   reservation mutation
//! - **Atomic batches**: a mutation and all its side effects commit together
//! - **Events after commit**: domain events reach the [`EventSink`] only once
//!   the batch is durable
//!
//! # Invariants
//!
//! - Conservation: cached balance == Σ(credits) − Σ(debits) for every wallet
//! - No overcommit: Σ(active holds) <= pool balance at every reservation
//! - Append-only: entries are never modified or deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod pagination;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use events::{topics, ChannelSink, DomainEvent, EventSink, FanoutSink, NoopSink};
pub use ledger::{Ledger, WalletVerification};
pub use pagination::{Page, PageResult};
pub use storage::{Storage, WriteBatch};
pub use types::{
    DebitOutcome, EntryKind, EntryReason, LedgerEntry, LimitAction, PoolAvailability,
    PoolReservation, ReservationStatus, TenantId, Wallet, WalletKind, WalletRef, WalletSettings,
};
