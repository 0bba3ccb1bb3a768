//! Prometheus metrics for webhook delivery

use lazy_static::lazy_static;
use prometheus::{register_histogram, register_int_counter_vec, Histogram, IntCounterVec};

lazy_static! {
    /// Deliveries created from domain events
    pub static ref WEBHOOK_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "webhook_enqueued_total",
        "Webhook deliveries created",
        &["event"]
    )
    .unwrap();

    /// Attempt outcomes
    pub static ref WEBHOOK_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "webhook_attempts_total",
        "Webhook delivery attempts by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Attempt duration
    pub static ref WEBHOOK_ATTEMPT_DURATION: Histogram = register_histogram!(
        "webhook_attempt_duration_seconds",
        "Webhook delivery attempt duration in seconds"
    )
    .unwrap();

    /// Operator replays
    pub static ref WEBHOOK_REPLAYS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "webhook_replays_total",
        "Webhook deliveries re-enqueued by replay",
        &["mode"]
    )
    .unwrap();
}
