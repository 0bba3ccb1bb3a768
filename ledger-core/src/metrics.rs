//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_debits_total` - Debits committed
//! - `ledger_credits_total` - Credits committed (including top-ups and transfers)
//! - `ledger_debit_amount` - Histogram of debit amounts
//! - `ledger_low_balance_events_total` - Low-balance events emitted
//! - `ledger_auto_topups_total` - Automatic top-ups applied
//! - `ledger_reservations_total` - Reservation operations by outcome

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Debits committed
    pub debits_total: IntCounter,

    /// Credits committed
    pub credits_total: IntCounter,

    /// Debit amount histogram
    pub debit_amount: Histogram,

    /// Low-balance events emitted
    pub low_balance_events_total: IntCounter,

    /// Automatic top-ups applied
    pub auto_topups_total: IntCounter,

    /// Reservation operations, labelled by operation and outcome
    pub reservations_total: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("debits_total", &self.debits_total.get())
            .field("credits_total", &self.credits_total.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let debits_total = IntCounter::new("ledger_debits_total", "Debits committed")?;
        registry.register(Box::new(debits_total.clone()))?;

        let credits_total = IntCounter::new("ledger_credits_total", "Credits committed")?;
        registry.register(Box::new(credits_total.clone()))?;

        let debit_amount = Histogram::with_opts(
            HistogramOpts::new("ledger_debit_amount", "Histogram of debit amounts")
                .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 1000.0]),
        )?;
        registry.register(Box::new(debit_amount.clone()))?;

        let low_balance_events_total = IntCounter::new(
            "ledger_low_balance_events_total",
            "Low-balance events emitted",
        )?;
        registry.register(Box::new(low_balance_events_total.clone()))?;

        let auto_topups_total =
            IntCounter::new("ledger_auto_topups_total", "Automatic top-ups applied")?;
        registry.register(Box::new(auto_topups_total.clone()))?;

        let reservations_total = IntCounterVec::new(
            Opts::new("ledger_reservations_total", "Reservation operations by outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(reservations_total.clone()))?;

        Ok(Self {
            debits_total,
            credits_total,
            debit_amount,
            low_balance_events_total,
            auto_topups_total,
            reservations_total,
            registry,
        })
    }

    /// Record a committed debit
    pub fn record_debit(&self, amount: f64) {
        self.debits_total.inc();
        self.debit_amount.observe(amount);
    }

    /// Record a committed credit
    pub fn record_credit(&self) {
        self.credits_total.inc();
    }

    /// Record a low-balance event
    pub fn record_low_balance(&self) {
        self.low_balance_events_total.inc();
    }

    /// Record an automatic top-up
    pub fn record_auto_topup(&self) {
        self.auto_topups_total.inc();
    }

    /// Record a reservation operation
    pub fn record_reservation(&self, operation: &str, outcome: &str) {
        self.reservations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.debits_total.get(), 0);
        assert_eq!(metrics.credits_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_debit(5.0);
        assert_eq!(a.debits_total.get(), 1);
        assert_eq!(b.debits_total.get(), 0);
    }

    #[test]
    fn test_record_reservation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reservation("reserve", "ok");
        metrics.record_reservation("reserve", "insufficient");
        metrics.record_reservation("reserve", "ok");
        assert_eq!(
            metrics
                .reservations_total
                .with_label_values(&["reserve", "ok"])
                .get(),
            2
        );
    }
}
