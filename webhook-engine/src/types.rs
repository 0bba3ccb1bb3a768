//! Webhook subscriptions and deliveries

use chrono::{DateTime, Utc};
use ledger_core::TenantId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant subscription to a set of event topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription ID (UUIDv7)
    pub subscription_id: Uuid,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Target URL
    pub url: String,
    /// HMAC secret
    pub secret: String,
    /// Topic patterns: exact, `*`, or `prefix.*`
    pub events: Vec<String>,
    /// Inactive subscriptions receive nothing
    pub active: bool,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Subscription is active and one of its patterns matches `topic`
    pub fn matches(&self, topic: &str) -> bool {
        self.active && self.events.iter().any(|pattern| topic_matches(pattern, topic))
    }
}

/// Match one pattern against a topic
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false),
        None => false,
    }
}

/// Delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for the first attempt or a scheduled retry
    Pending,
    /// Receiver answered 2xx
    Ok,
    /// Retry ladder exhausted; manual replay only
    Fail,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Ok => "ok",
            DeliveryStatus::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// One event bound for one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Delivery ID (UUIDv7)
    pub delivery_id: Uuid,
    /// Target subscription
    pub subscription_id: Uuid,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Topic
    pub event: String,
    /// Source domain event
    pub event_id: Uuid,
    /// JSON body exactly as posted
    pub payload: String,
    /// Status
    pub status: DeliveryStatus,
    /// Attempts since creation or last replay
    pub attempt_count: u32,
    /// Last attempt time
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Next due attempt; `None` while an attempt is in flight or when settled
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last HTTP status received
    pub last_response_status: Option<u16>,
    /// Last failure description
    pub last_error: Option<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Pending and due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending
            && self.next_attempt_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Filter for operator bulk replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFilter {
    /// Exact topic
    pub event: Option<String>,
    /// Tenant
    pub tenant_id: Option<TenantId>,
    /// Created at or after
    pub from: Option<DateTime<Utc>>,
    /// Created before
    pub to: Option<DateTime<Utc>>,
}

impl ReplayFilter {
    /// Row falls inside the filter
    pub fn matches(&self, delivery: &WebhookDelivery) -> bool {
        self.event.as_deref().map_or(true, |e| e == delivery.event)
            && self.tenant_id.map_or(true, |t| t == delivery.tenant_id)
            && self.from.map_or(true, |from| delivery.created_at >= from)
            && self.to.map_or(true, |to| delivery.created_at < to)
    }
}

/// Filter for listing deliveries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryQuery {
    /// Tenant
    pub tenant_id: Option<TenantId>,
    /// Status
    pub status: Option<DeliveryStatus>,
    /// Exact topic
    pub event: Option<String>,
}

impl DeliveryQuery {
    /// Row falls inside the query
    pub fn matches(&self, delivery: &WebhookDelivery) -> bool {
        self.tenant_id.map_or(true, |t| t == delivery.tenant_id)
            && self.status.map_or(true, |s| s == delivery.status)
            && self.event.as_deref().map_or(true, |e| e == delivery.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_patterns() {
        assert!(topic_matches("*", "document.sent"));
        assert!(topic_matches("document.sent", "document.sent"));
        assert!(topic_matches("document.*", "document.failed"));
        assert!(!topic_matches("document.*", "documents.failed"));
        assert!(!topic_matches("document.*", "document"));
        assert!(!topic_matches("wallet.low_balance", "wallet.auto_topup"));
    }

    #[test]
    fn test_inactive_subscription_matches_nothing() {
        let sub = Subscription {
            subscription_id: Uuid::now_v7(),
            tenant_id: TenantId::new(),
            url: "https://example.test/hook".into(),
            secret: "s".into(),
            events: vec!["*".into()],
            active: false,
            created_at: Utc::now(),
        };
        assert!(!sub.matches("document.sent"));
    }
}
