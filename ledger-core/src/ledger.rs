//! Main ledger orchestration layer
//!
//! This module ties together storage, the single-writer actor, metrics and
//! the event sink into a high-level API for wallet settlement.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{Config, Ledger, NoopSink, TenantId, WalletRef, EntryReason};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ledger_core::Result<()> {
//!     let ledger = Ledger::open(Config::default(), Arc::new(NoopSink)).await?;
//!
//!     let wallet = WalletRef::main(TenantId::new());
//!     ledger.credit(wallet, Decimal::from(100), EntryReason::PackageTopup, None).await?;
//!     ledger.debit_for_document(wallet, Decimal::ONE, EntryReason::InvoiceSent, "doc").await?;
//!
//!     Ok(())
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    events::EventSink,
    metrics::Metrics,
    pagination::{paginate, Page, PageResult},
    types::{
        DebitOutcome, EntryReason, LedgerEntry, PoolAvailability, PoolReservation, TenantId,
        Wallet, WalletRef, WalletSettings,
    },
    Config, Error, Result, Storage,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of rebuilding a wallet balance from its entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletVerification {
    /// Wallet checked
    pub wallet: WalletRef,
    /// Balance cached on the wallet row
    pub cached_balance: Decimal,
    /// Running sum of all entries
    pub rebuilt_balance: Decimal,
    /// Number of entries summed
    pub entry_count: usize,
}

impl WalletVerification {
    /// Cached balance matches the entry sum
    pub fn is_consistent(&self) -> bool {
        self.cached_balance == self.rebuilt_balance
    }
}

/// Main ledger interface
#[derive(Clone)]
pub struct Ledger {
    /// Actor handle for mutations
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Storage,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Arc<Config>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("storage", &self.storage)
            .field("service", &self.config.service_name)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let storage = Storage::open(&config)?;
        Self::with_storage(config, storage, sink)
    }

    /// Build a ledger over an already opened storage.
    ///
    /// Must be called inside a Tokio runtime; the writer task is spawned here.
    pub fn with_storage(config: Config, storage: Storage, sink: Arc<dyn EventSink>) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let handle = spawn_ledger_actor(
            storage.clone(),
            sink,
            metrics.clone(),
            config.default_unit.clone(),
            config.operator_tenant(),
            config.mailbox_capacity,
        );

        tracing::info!(
            service = %config.service_name,
            operator = %config.operator_tenant(),
            "Ledger opened"
        );

        Ok(Self {
            handle,
            storage,
            metrics,
            config: Arc::new(config),
        })
    }

    /// Debit a wallet for a sent document.
    ///
    /// The reference (document id) is mandatory. The balance may go negative;
    /// limits are enforced on document creation, not here. Low-balance and auto-top-up effects commit in the same batch.
    pub async fn debit_for_document(
        &self,
        wallet: WalletRef,
        amount: Decimal,
        reason: EntryReason,
        reference: impl Into<String>,
    ) -> Result<DebitOutcome> {
        self.handle.debit(wallet, amount, reason, Some(reference.into())).await
    }

    /// Credit a wallet
    pub async fn credit(
        &self,
        wallet: WalletRef,
        amount: Decimal,
        reason: EntryReason,
        reference: Option<String>,
    ) -> Result<(Wallet, LedgerEntry)> {
        self.handle.credit(wallet, amount, reason, reference).await
    }

    /// Operator adjustment: positive amounts credit, negative amounts debit
    pub async fn manual_adjustment(
        &self,
        wallet: WalletRef,
        signed_amount: Decimal,
        reference: Option<String>,
    ) -> Result<Wallet> {
        if signed_amount.is_zero() {
            return Err(Error::InvalidAmount(signed_amount));
        }

        tracing::info!(wallet = %wallet, amount = %signed_amount, "Manual adjustment");

        if signed_amount.is_sign_positive() {
            let (wallet, _) = self
                .handle
                .credit(wallet, signed_amount, EntryReason::ManualAdjustment, reference)
                .await?;
            Ok(wallet)
        } else {
            let outcome = self
                .handle
                .debit(wallet, -signed_amount, EntryReason::ManualAdjustment, reference)
                .await?;
            Ok(outcome.wallet)
        }
    }

    /// Replace thresholds, auto-top-up and document limits for a wallet
    pub async fn configure_wallet(&self, wallet: WalletRef, settings: WalletSettings) -> Result<Wallet> {
        self.handle.configure(wallet, settings).await
    }

    /// Read a wallet; unknown wallets read as a zero-balance default
    pub fn get_wallet(&self, wallet: WalletRef) -> Result<Wallet> {
        Ok(self
            .storage
            .get_wallet(&wallet)?
            .unwrap_or_else(|| Wallet::new(wallet, self.config.default_unit.clone(), Utc::now())))
    }

    /// Ledger history of a wallet, newest first
    pub fn entries(&self, wallet: WalletRef, page: &Page) -> Result<PageResult<LedgerEntry>> {
        let entries = self.storage.wallet_entries(&wallet)?;
        paginate(entries, page, |e| e.entry_id)
    }

    /// Rebuild the balance from entries and compare with the cached value
    pub fn verify_wallet(&self, wallet: WalletRef) -> Result<WalletVerification> {
        let cached_balance = self
            .storage
            .get_wallet(&wallet)?
            .map(|w| w.balance)
            .unwrap_or(Decimal::ZERO);
        let entries = self.storage.wallet_entries(&wallet)?;
        let rebuilt_balance = entries.iter().map(LedgerEntry::signed_amount).sum();

        let verification = WalletVerification {
            wallet,
            cached_balance,
            rebuilt_balance,
            entry_count: entries.len(),
        };

        if !verification.is_consistent() {
            tracing::error!(
                wallet = %wallet,
                cached = %cached_balance,
                rebuilt = %rebuilt_balance,
                "Wallet balance diverges from its entries"
            );
        }

        Ok(verification)
    }

    /// Hold pool credits for a purchase until capture, cancel or expiry
    pub async fn reserve_pool_credits(
        &self,
        buyer: TenantId,
        payment_ref: impl Into<String>,
        credits: u64,
        ttl: Option<std::time::Duration>,
    ) -> Result<PoolReservation> {
        let ttl = ttl.unwrap_or_else(|| {
            std::time::Duration::from_secs(self.config.reservations.default_ttl_secs)
        });
        let ttl = Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("Reservation ttl out of range: {}", e)))?;

        self.handle
            .reserve(buyer, payment_ref.into(), credits, Utc::now() + ttl)
            .await
    }

    /// Payment succeeded: transfer the held credits to the buyer's e-credit wallet
    pub async fn capture_reservation(&self, payment_ref: impl Into<String>) -> Result<PoolReservation> {
        self.handle.capture(payment_ref.into()).await
    }

    /// Payment failed: release the hold
    pub async fn cancel_reservation(&self, payment_ref: impl Into<String>) -> Result<PoolReservation> {
        self.handle.cancel(payment_ref.into()).await
    }

    /// Release holds whose expiry is before `now`
    pub async fn sweep_expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<PoolReservation>> {
        self.handle.sweep(now).await
    }

    /// Pool balance minus active holds
    pub fn pool_availability(&self) -> Result<PoolAvailability> {
        let balance = self
            .storage
            .get_wallet(&self.pool_wallet())?
            .map(|w| w.balance)
            .unwrap_or(Decimal::ZERO);
        let reserved = self.storage.reserved_credits()?;

        Ok(PoolAvailability {
            balance,
            reserved,
            available: balance - reserved,
        })
    }

    /// Look up a reservation
    pub fn get_reservation(&self, payment_ref: &str) -> Result<Option<PoolReservation>> {
        self.storage.get_reservation(payment_ref)
    }

    /// Operator-owned pool wallet
    pub fn pool_wallet(&self) -> WalletRef {
        WalletRef::pool(self.config.operator_tenant())
    }

    /// Shared storage handle
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the writer task
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{topics, ChannelSink, NoopSink};
    use crate::types::{EntryKind, LimitAction, ReservationStatus};
    use rust_decimal_macros::dec;

    fn test_ledger() -> Ledger {
        Ledger::with_storage(Config::default(), Storage::in_memory(), Arc::new(NoopSink)).unwrap()
    }

    #[tokio::test]
    async fn test_debit_goes_negative_and_records_entry() {
        let ledger = test_ledger();
        let wallet = WalletRef::main(TenantId::new());

        let outcome = ledger
            .debit_for_document(wallet, dec!(1.5), EntryReason::InvoiceSent, "doc-1")
            .await
            .unwrap();

        assert_eq!(outcome.wallet.balance, dec!(-1.5));
        assert_eq!(outcome.entry.kind, EntryKind::Debit);
        assert_eq!(outcome.entry.balance_after, dec!(-1.5));
        assert_eq!(outcome.entry.reference.as_deref(), Some("doc-1"));
        assert!(outcome.auto_topup.is_none());
        assert!(ledger.verify_wallet(wallet).unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_unknown_wallet_reads_as_zero_without_persisting() {
        let ledger = test_ledger();
        let wallet = WalletRef::e_credit(TenantId::new());

        let view = ledger.get_wallet(wallet).unwrap();
        assert_eq!(view.balance, Decimal::ZERO);
        assert!(ledger.storage().get_wallet(&wallet).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_low_balance_triggers_auto_topup_in_same_commit() {
        let (sink, mut events) = ChannelSink::new();
        let ledger =
            Ledger::with_storage(Config::default(), Storage::in_memory(), Arc::new(sink)).unwrap();
        let wallet = WalletRef::main(TenantId::new());

        ledger
            .configure_wallet(
                wallet,
                WalletSettings {
                    low_balance_threshold: dec!(10),
                    auto_topup_enabled: true,
                    auto_topup_amount: dec!(100),
                    doc_limit_daily: None,
                    doc_limit_monthly: None,
                    limit_action: LimitAction::Continue,
                },
            )
            .await
            .unwrap();
        ledger
            .credit(wallet, dec!(12), EntryReason::PackageTopup, None)
            .await
            .unwrap();

        let outcome = ledger
            .debit_for_document(wallet, dec!(5), EntryReason::InvoiceSent, "doc-5")
            .await
            .unwrap();

        assert!(outcome.low_balance);
        let topup = outcome.auto_topup.expect("auto top-up entry");
        assert_eq!(topup.reason, EntryReason::AutoTopup);
        assert_eq!(outcome.wallet.balance, dec!(107));

        let first = events.recv().await.unwrap();
        assert_eq!(first.topic, topics::WALLET_LOW_BALANCE);
        let second = events.recv().await.unwrap();
        assert_eq!(second.topic, topics::WALLET_AUTO_TOPUP);

        let verification = ledger.verify_wallet(wallet).unwrap();
        assert!(verification.is_consistent());
        assert_eq!(verification.entry_count, 3);
    }

    #[tokio::test]
    async fn test_manual_adjustment_both_directions() {
        let ledger = test_ledger();
        let wallet = WalletRef::main(TenantId::new());

        let wallet_state = ledger.manual_adjustment(wallet, dec!(20), None).await.unwrap();
        assert_eq!(wallet_state.balance, dec!(20));

        let wallet_state = ledger.manual_adjustment(wallet, dec!(-7), None).await.unwrap();
        assert_eq!(wallet_state.balance, dec!(13));

        assert!(matches!(
            ledger.manual_adjustment(wallet, Decimal::ZERO, None).await,
            Err(Error::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_entries_paginate_newest_first() {
        let ledger = test_ledger();
        let wallet = WalletRef::main(TenantId::new());
        for _ in 0..5 {
            ledger
                .credit(wallet, Decimal::ONE, EntryReason::PackageTopup, None)
                .await
                .unwrap();
        }

        let first = ledger.entries(wallet, &Page::first(3)).unwrap();
        assert_eq!(first.items.len(), 3);
        assert_eq!(first.items[0].balance_after, dec!(5));
        let cursor = first.next_cursor.expect("more pages");

        let second = ledger.entries(wallet, &Page::after(cursor, 3)).unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_reservation_lifecycle() {
        let ledger = test_ledger();
        let buyer = TenantId::new();
        ledger
            .credit(ledger.pool_wallet(), dec!(100), EntryReason::ManualAdjustment, None)
            .await
            .unwrap();

        let held = ledger
            .reserve_pool_credits(buyer, "pay-1", 40, None)
            .await
            .unwrap();
        assert_eq!(held.status, ReservationStatus::Reserved);
        assert_eq!(ledger.pool_availability().unwrap().available, dec!(60));

        assert!(matches!(
            ledger.reserve_pool_credits(buyer, "pay-1", 1, None).await,
            Err(Error::ReservationExists(_))
        ));

        let captured = ledger.capture_reservation("pay-1").await.unwrap();
        assert_eq!(captured.status, ReservationStatus::Consumed);
        assert_eq!(ledger.get_wallet(WalletRef::e_credit(buyer)).unwrap().balance, dec!(40));

        let availability = ledger.pool_availability().unwrap();
        assert_eq!(availability.balance, dec!(60));
        assert_eq!(availability.reserved, Decimal::ZERO);

        // Second capture is a no-op
        ledger.capture_reservation("pay-1").await.unwrap();
        assert_eq!(ledger.get_wallet(WalletRef::e_credit(buyer)).unwrap().balance, dec!(40));

        assert!(matches!(
            ledger.cancel_reservation("pay-1").await,
            Err(Error::InvalidReservationState { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_reservation_cannot_be_captured() {
        let ledger = test_ledger();
        ledger
            .credit(ledger.pool_wallet(), dec!(10), EntryReason::ManualAdjustment, None)
            .await
            .unwrap();
        ledger
            .reserve_pool_credits(TenantId::new(), "pay-2", 10, None)
            .await
            .unwrap();

        ledger.cancel_reservation("pay-2").await.unwrap();
        ledger.cancel_reservation("pay-2").await.unwrap();

        assert!(matches!(
            ledger.capture_reservation("pay-2").await,
            Err(Error::InvalidReservationState { .. })
        ));
        assert_eq!(ledger.pool_availability().unwrap().available, dec!(10));
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_holds() {
        let ledger = test_ledger();
        ledger
            .credit(ledger.pool_wallet(), dec!(10), EntryReason::ManualAdjustment, None)
            .await
            .unwrap();
        ledger
            .reserve_pool_credits(
                TenantId::new(),
                "pay-3",
                10,
                Some(std::time::Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert!(ledger.sweep_expired_reservations(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + Duration::minutes(5);
        let released = ledger.sweep_expired_reservations(later).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].status, ReservationStatus::Cancelled);
        assert_eq!(ledger.pool_availability().unwrap().available, dec!(10));
    }

    #[tokio::test]
    async fn test_missing_reservation() {
        let ledger = test_ledger();
        assert!(matches!(
            ledger.capture_reservation("nope").await,
            Err(Error::ReservationNotFound(_))
        ));
    }
}
