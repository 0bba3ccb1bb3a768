//! Document Engine
//!
//! Lifecycle of tenant e-documents (invoice, voucher, despatch) from
//! idempotent intake to provider acceptance, with metered charging and a
//! dead-letter boundary for work that cannot be delivered.
//!
//! # State machine
//!
//! ```text
//! queued ──claim──► processing ──accepted──► sent
//!   │                 │   ▲
//!   │                 │   └── transient (retry scheduled)
//!   │                 ├──rejected / ceiling exceeded──► failed ──retry──► queued
//!   └──cancel──► canceled ◄──cancel (only while waiting for a retry)
//! ```
//!
//! # Ordering
//!
//! The ledger debit for a document is committed only after the provider has
//! accepted it. A debit that fails afterwards leaves the document sent and
//! raises `ledger.debit_failed` for an operator to correct.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod limits;
pub mod metrics;
pub mod node;
pub mod purchase;
pub mod store;
pub mod types;
pub mod validator;
pub mod worker;

// Re-exports
pub use config::{ChargingModel, EngineConfig, GatewayConfig, PriceTable, WorkerConfig};
pub use engine::DocumentEngine;
pub use error::{Error, Result};
pub use gateway::{HttpProviderGateway, ProviderGateway};
pub use node::{Node, NodeConfig};
pub use purchase::ENDPOINT_PURCHASE;
pub use types::*;
pub use validator::{AcceptAll, BasicValidator, PayloadValidator};
pub use worker::DispatchWorker;
