//! Prometheus metrics for documents and dispatch

use lazy_static::lazy_static;
use prometheus::{register_histogram, register_int_counter_vec, Histogram, IntCounterVec};

lazy_static! {
    /// Documents accepted on create
    pub static ref DOCUMENTS_CREATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "documents_created_total",
        "Documents accepted into the queue",
        &["kind"]
    )
    .unwrap();

    /// Dispatch attempt outcomes
    pub static ref DISPATCH_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dispatch_attempts_total",
        "Provider dispatch attempts by outcome",
        &["kind", "outcome"]
    )
    .unwrap();

    /// Gateway call duration
    pub static ref DISPATCH_DURATION: Histogram = register_histogram!(
        "dispatch_duration_seconds",
        "Provider gateway call duration in seconds"
    )
    .unwrap();

    /// Dead letters written
    pub static ref DEAD_LETTERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dead_letters_total",
        "Documents dead-lettered",
        &["kind"]
    )
    .unwrap();

    /// Requeues from dead letters or failed state
    pub static ref REQUEUES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "document_requeues_total",
        "Documents put back into the queue",
        &["source"]
    )
    .unwrap();
}
