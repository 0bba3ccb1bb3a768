//! Webhook Delivery Engine
//!
//! Turns domain events into signed HTTP notifications for subscribed
//! tenants, with a fixed retry ladder, terminal failure, and operator replay.
//!
//! # Delivery lifecycle
//!
//! ```text
//! event ──► pending ──2xx──► ok
//!              │
//!              └─fail─► pending (+1m, +5m, +30m, +2h, +24h) ──exhausted──► fail
//!                                                                        │
//!                              replay / bulk_replay ◄────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod schedule;
pub mod signing;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use config::WebhookConfig;
pub use engine::WebhookEngine;
pub use error::{Error, Result};
pub use schedule::RetrySchedule;
pub use transport::{HttpTransport, NotificationTransport};
pub use types::{DeliveryQuery, DeliveryStatus, ReplayFilter, Subscription, WebhookDelivery};
