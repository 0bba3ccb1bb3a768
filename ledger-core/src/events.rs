//! Domain events emitted after a committed mutation
//!
//! Producers (the ledger actor, the document engine) publish through an
//! [`EventSink`]. Publishing happens after the storage batch is committed and
//! must never block on network I/O: sinks enqueue, they do not deliver.

use crate::types::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Well-known event topics
pub mod topics {
    /// Wallet balance fell to or below its threshold
    pub const WALLET_LOW_BALANCE: &str = "wallet.low_balance";
    /// Automatic top-up credited
    pub const WALLET_AUTO_TOPUP: &str = "wallet.auto_topup";
    /// Provider accepted a document
    pub const DOCUMENT_SENT: &str = "document.sent";
    /// Document dispatch gave up
    pub const DOCUMENT_FAILED: &str = "document.failed";
    /// Ledger debit for an accepted document could not be committed
    pub const LEDGER_DEBIT_FAILED: &str = "ledger.debit_failed";
}

/// A tenant-scoped domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event ID
    pub event_id: Uuid,
    /// Tenant the event belongs to
    pub tenant_id: TenantId,
    /// Topic, e.g. `wallet.low_balance`
    pub topic: String,
    /// JSON payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Build a new event stamped now
    pub fn new(tenant_id: TenantId, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            tenant_id,
            topic: topic.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// Receiver of domain events
pub trait EventSink: Send + Sync {
    /// Hand the event off; must not block on network I/O
    fn publish(&self, event: DomainEvent);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, event: DomainEvent) {
        tracing::trace!(topic = %event.topic, "Event dropped (no sink)");
    }
}

/// Sink that forwards into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<DomainEvent>,
}

impl ChannelSink {
    /// Create a sink and its receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: DomainEvent) {
        if self.sender.send(event).is_err() {
            tracing::warn!("Event channel closed, event dropped");
        }
    }
}

/// Sink that forwards to several sinks in order
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink").field("sinks", &self.sinks.len()).finish()
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: DomainEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}
