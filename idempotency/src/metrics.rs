//! Prometheus metrics for the idempotency guard

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    /// Guard decisions by outcome
    pub static ref IDEMPOTENCY_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "idempotency_requests_total",
        "Guarded requests by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Records removed by purge
    pub static ref IDEMPOTENCY_PURGED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "idempotency_purged_total",
        "Expired idempotency records removed",
        &["status"]
    )
    .unwrap();
}

/// Record a guard outcome
pub fn record_outcome(outcome: &str) {
    IDEMPOTENCY_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}
