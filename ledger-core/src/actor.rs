//! Actor-based concurrency for the ledger
//!
//! This module implements the single-writer pattern using Tokio actors:
//! - One logical writer task owns every wallet and reservation mutation
//! - Each mutation is read-modify-write followed by one atomic batch
//! - Async message passing with backpressure (bounded mailbox)
//!
//! The writer is the serialization point for wallet rows and the pool: two
//! concurrent debits on one wallet, or two reservations racing for the last
//! pool credits, are applied one after the other against committed state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │      Document engine / payment callbacks / operator   │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │   reload rows → compute → Storage::write(batch)      │
//! │   then publish domain events                          │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::events::{topics, DomainEvent, EventSink};
use crate::metrics::Metrics;
use crate::storage::{Storage, WriteBatch};
use crate::types::{
    DebitOutcome, EntryKind, EntryReason, LedgerEntry, PoolReservation, ReservationStatus,
    TenantId, Wallet, WalletRef, WalletSettings,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message sent to the ledger actor
pub enum LedgerMessage {
    /// Debit a wallet (with low-balance hook)
    Debit {
        wallet: WalletRef,
        amount: Decimal,
        reason: EntryReason,
        reference: Option<String>,
        response: oneshot::Sender<Result<DebitOutcome>>,
    },

    /// Credit a wallet
    Credit {
        wallet: WalletRef,
        amount: Decimal,
        reason: EntryReason,
        reference: Option<String>,
        response: oneshot::Sender<Result<(Wallet, LedgerEntry)>>,
    },

    /// Replace wallet policy
    Configure {
        wallet: WalletRef,
        settings: WalletSettings,
        response: oneshot::Sender<Result<Wallet>>,
    },

    /// Hold pool credits for an in-flight purchase
    Reserve {
        buyer: TenantId,
        payment_ref: String,
        credits: u64,
        expires_at: DateTime<Utc>,
        response: oneshot::Sender<Result<PoolReservation>>,
    },

    /// Payment captured: move held credits to the buyer
    Capture {
        payment_ref: String,
        response: oneshot::Sender<Result<PoolReservation>>,
    },

    /// Payment failed: release the hold
    Cancel {
        payment_ref: String,
        response: oneshot::Sender<Result<PoolReservation>>,
    },

    /// Release every hold that expired before `now`
    Sweep {
        now: DateTime<Utc>,
        response: oneshot::Sender<Result<Vec<PoolReservation>>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger messages
pub struct LedgerActor {
    /// Storage backend
    storage: Storage,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,

    /// Receiver of post-commit events
    sink: Arc<dyn EventSink>,

    /// Metrics
    metrics: Metrics,

    /// Unit stamped on new wallets
    unit: String,

    /// Shared pool wallet
    pool: WalletRef,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        storage: Storage,
        mailbox: mpsc::Receiver<LedgerMessage>,
        sink: Arc<dyn EventSink>,
        metrics: Metrics,
        unit: String,
        operator: TenantId,
    ) -> Self {
        Self {
            storage,
            mailbox,
            sink,
            metrics,
            unit,
            pool: WalletRef::pool(operator),
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => break,
                msg => self.handle_message(msg),
            }
        }
        tracing::info!("Ledger actor stopped");
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::Debit { wallet, amount, reason, reference, response } => {
                let _ = response.send(self.debit(wallet, amount, reason, reference));
            }

            LedgerMessage::Credit { wallet, amount, reason, reference, response } => {
                let _ = response.send(self.credit(wallet, amount, reason, reference));
            }

            LedgerMessage::Configure { wallet, settings, response } => {
                let _ = response.send(self.configure(wallet, settings));
            }

            LedgerMessage::Reserve { buyer, payment_ref, credits, expires_at, response } => {
                let result = self.reserve(buyer, payment_ref, credits, expires_at);
                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(Error::InsufficientPoolCredits { .. }) => "insufficient",
                    Err(_) => "error",
                };
                self.metrics.record_reservation("reserve", outcome);
                let _ = response.send(result);
            }

            LedgerMessage::Capture { payment_ref, response } => {
                let result = self.capture(&payment_ref);
                self.metrics
                    .record_reservation("capture", if result.is_ok() { "ok" } else { "error" });
                let _ = response.send(result);
            }

            LedgerMessage::Cancel { payment_ref, response } => {
                let result = self.cancel(&payment_ref);
                self.metrics
                    .record_reservation("cancel", if result.is_ok() { "ok" } else { "error" });
                let _ = response.send(result);
            }

            LedgerMessage::Sweep { now, response } => {
                let _ = response.send(self.sweep(now));
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn load_wallet(&self, wallet: WalletRef, now: DateTime<Utc>) -> Result<Wallet> {
        Ok(self
            .storage
            .get_wallet(&wallet)?
            .unwrap_or_else(|| Wallet::new(wallet, self.unit.clone(), now)))
    }

    fn debit(
        &mut self,
        wallet: WalletRef,
        amount: Decimal,
        reason: EntryReason,
        reference: Option<String>,
    ) -> Result<DebitOutcome> {
        ensure_positive(amount)?;
        let now = Utc::now();
        let mut state = self.load_wallet(wallet, now)?;

        if wallet == self.pool && reason != EntryReason::TransferToCustomer {
            let reserved = self.storage.reserved_credits()?;
            if state.balance - amount < reserved {
                tracing::warn!(
                    balance = %state.balance,
                    amount = %amount,
                    reserved = %reserved,
                    "Pool debit rejected, holds would be uncovered"
                );
                return Err(Error::PoolBalanceBelowReservations {
                    balance: state.balance,
                    amount,
                    reserved,
                });
            }
        }

        let mut batch = WriteBatch::new();
        let mut events = Vec::new();
        let (entry, auto_topup, low_balance) =
            self.stage_debit(&mut state, amount, reason, reference, now, &mut batch, &mut events)?;
        Storage::stage_wallet(&mut batch, &state)?;
        self.storage.write(batch)?;

        tracing::debug!(
            wallet = %wallet,
            amount = %amount,
            reason = %reason,
            balance = %state.balance,
            "Debit committed"
        );

        self.publish(events);
        Ok(DebitOutcome { wallet: state, entry, auto_topup, low_balance })
    }

    /// Stage a debit plus the low-balance hook into `batch`. The caller
    /// stages the wallet row itself once all mutations are applied.
    #[allow(clippy::too_many_arguments)]
    fn stage_debit(
        &self,
        state: &mut Wallet,
        amount: Decimal,
        reason: EntryReason,
        reference: Option<String>,
        now: DateTime<Utc>,
        batch: &mut WriteBatch,
        events: &mut Vec<DomainEvent>,
    ) -> Result<(LedgerEntry, Option<LedgerEntry>, bool)> {
        let entry = apply_entry(state, EntryKind::Debit, amount, reason, reference.clone(), now);
        Storage::stage_entry(batch, &entry)?;
        self.metrics.record_debit(amount.to_f64().unwrap_or(0.0));

        let low_balance = state.is_low();
        let mut auto_topup = None;

        if low_balance {
            self.metrics.record_low_balance();
            events.push(DomainEvent::new(
                state.wallet.tenant_id,
                topics::WALLET_LOW_BALANCE,
                serde_json::json!({
                    "wallet": state.wallet.kind.as_str(),
                    "balance": entry.balance_after,
                    "threshold": state.settings.low_balance_threshold,
                    "auto_topup": state.settings.auto_topup_enabled,
                }),
            ));

            let topup_amount = state.settings.auto_topup_amount;
            if state.settings.auto_topup_enabled && topup_amount > Decimal::ZERO {
                let topup = apply_entry(
                    state,
                    EntryKind::Credit,
                    topup_amount,
                    EntryReason::AutoTopup,
                    reference,
                    now,
                );
                Storage::stage_entry(batch, &topup)?;
                self.metrics.record_auto_topup();
                self.metrics.record_credit();
                events.push(DomainEvent::new(
                    state.wallet.tenant_id,
                    topics::WALLET_AUTO_TOPUP,
                    serde_json::json!({
                        "wallet": state.wallet.kind.as_str(),
                        "amount": topup_amount,
                        "balance": topup.balance_after,
                    }),
                ));
                tracing::info!(
                    wallet = %state.wallet,
                    amount = %topup_amount,
                    "Auto top-up applied"
                );
                auto_topup = Some(topup);
            }
        }

        Ok((entry, auto_topup, low_balance))
    }

    fn credit(
        &mut self,
        wallet: WalletRef,
        amount: Decimal,
        reason: EntryReason,
        reference: Option<String>,
    ) -> Result<(Wallet, LedgerEntry)> {
        ensure_positive(amount)?;
        let now = Utc::now();
        let mut state = self.load_wallet(wallet, now)?;
        let entry = apply_entry(&mut state, EntryKind::Credit, amount, reason, reference, now);

        let mut batch = WriteBatch::new();
        Storage::stage_entry(&mut batch, &entry)?;
        Storage::stage_wallet(&mut batch, &state)?;
        self.storage.write(batch)?;
        self.metrics.record_credit();

        tracing::debug!(wallet = %wallet, amount = %amount, reason = %reason, "Credit committed");
        Ok((state, entry))
    }

    fn configure(&mut self, wallet: WalletRef, settings: WalletSettings) -> Result<Wallet> {
        let now = Utc::now();
        let mut state = self.load_wallet(wallet, now)?;
        state.settings = settings;
        state.updated_at = now;

        let mut batch = WriteBatch::new();
        Storage::stage_wallet(&mut batch, &state)?;
        self.storage.write(batch)?;

        tracing::info!(wallet = %wallet, "Wallet settings updated");
        Ok(state)
    }

    fn reserve(
        &mut self,
        buyer: TenantId,
        payment_ref: String,
        credits: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<PoolReservation> {
        if credits == 0 {
            return Err(Error::InvalidAmount(Decimal::ZERO));
        }
        if self.storage.get_reservation(&payment_ref)?.is_some() {
            return Err(Error::ReservationExists(payment_ref));
        }

        // Availability is computed and the hold inserted with no other
        // writer in between.
        let balance = self
            .storage
            .get_wallet(&self.pool)?
            .map(|w| w.balance)
            .unwrap_or(Decimal::ZERO);
        let reserved = self.storage.reserved_credits()?;
        let available = balance - reserved;

        if available < Decimal::from(credits) {
            tracing::warn!(
                payment_ref = %payment_ref,
                requested = credits,
                available = %available,
                "Pool reservation rejected"
            );
            return Err(Error::InsufficientPoolCredits { requested: credits, available });
        }

        let now = Utc::now();
        let reservation = PoolReservation {
            payment_ref,
            buyer_tenant_id: buyer,
            credits,
            status: ReservationStatus::Reserved,
            expires_at,
            created_at: now,
            updated_at: now,
        };

        let mut batch = WriteBatch::new();
        Storage::stage_reservation(&mut batch, &reservation)?;
        self.storage.write(batch)?;

        tracing::info!(
            payment_ref = %reservation.payment_ref,
            buyer = %buyer,
            credits,
            "Pool credits reserved"
        );
        Ok(reservation)
    }

    fn capture(&mut self, payment_ref: &str) -> Result<PoolReservation> {
        let mut reservation = self
            .storage
            .get_reservation(payment_ref)?
            .ok_or_else(|| Error::ReservationNotFound(payment_ref.to_string()))?;

        match reservation.status {
            ReservationStatus::Reserved => {}
            ReservationStatus::Consumed => {
                tracing::info!(payment_ref, "Reservation already consumed, capture is a no-op");
                return Ok(reservation);
            }
            ReservationStatus::Cancelled => {
                return Err(Error::InvalidReservationState {
                    payment_ref: payment_ref.to_string(),
                    status: reservation.status.to_string(),
                    operation: "capture",
                });
            }
        }

        let now = Utc::now();
        let credits = Decimal::from(reservation.credits);
        let mut pool = self.load_wallet(self.pool, now)?;
        if pool.balance < credits {
            tracing::error!(
                payment_ref,
                pool_balance = %pool.balance,
                credits = %credits,
                "Pool balance below an outstanding hold"
            );
            return Err(Error::InvariantViolation(format!(
                "pool balance {} cannot cover reservation {} of {}",
                pool.balance, payment_ref, credits
            )));
        }

        let mut batch = WriteBatch::new();
        let mut events = Vec::new();
        self.stage_debit(
            &mut pool,
            credits,
            EntryReason::TransferToCustomer,
            Some(payment_ref.to_string()),
            now,
            &mut batch,
            &mut events,
        )?;

        let mut buyer = self.load_wallet(WalletRef::e_credit(reservation.buyer_tenant_id), now)?;
        let credit_entry = apply_entry(
            &mut buyer,
            EntryKind::Credit,
            credits,
            EntryReason::PackageTopup,
            Some(payment_ref.to_string()),
            now,
        );
        Storage::stage_entry(&mut batch, &credit_entry)?;

        reservation.status = ReservationStatus::Consumed;
        reservation.updated_at = now;

        Storage::stage_wallet(&mut batch, &pool)?;
        Storage::stage_wallet(&mut batch, &buyer)?;
        Storage::stage_reservation(&mut batch, &reservation)?;
        self.storage.write(batch)?;
        self.metrics.record_credit();

        tracing::info!(
            payment_ref,
            buyer = %reservation.buyer_tenant_id,
            credits = reservation.credits,
            "Pool credits transferred"
        );

        self.publish(events);
        Ok(reservation)
    }

    fn cancel(&mut self, payment_ref: &str) -> Result<PoolReservation> {
        let mut reservation = self
            .storage
            .get_reservation(payment_ref)?
            .ok_or_else(|| Error::ReservationNotFound(payment_ref.to_string()))?;

        match reservation.status {
            ReservationStatus::Reserved => {}
            ReservationStatus::Cancelled => return Ok(reservation),
            ReservationStatus::Consumed => {
                return Err(Error::InvalidReservationState {
                    payment_ref: payment_ref.to_string(),
                    status: reservation.status.to_string(),
                    operation: "cancel",
                });
            }
        }

        reservation.status = ReservationStatus::Cancelled;
        reservation.updated_at = Utc::now();

        let mut batch = WriteBatch::new();
        Storage::stage_reservation(&mut batch, &reservation)?;
        self.storage.write(batch)?;

        tracing::info!(payment_ref, "Pool reservation cancelled");
        Ok(reservation)
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> Result<Vec<PoolReservation>> {
        let mut expired: Vec<PoolReservation> = self
            .storage
            .reservations()?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect();

        if expired.is_empty() {
            return Ok(expired);
        }

        let mut batch = WriteBatch::new();
        for reservation in &mut expired {
            reservation.status = ReservationStatus::Cancelled;
            reservation.updated_at = now;
            Storage::stage_reservation(&mut batch, reservation)?;
        }
        self.storage.write(batch)?;

        for _ in &expired {
            self.metrics.record_reservation("sweep", "cancelled");
        }
        tracing::info!(count = expired.len(), "Expired pool reservations released");
        Ok(expired)
    }

    fn publish(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.sink.publish(event);
        }
    }
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(amount));
    }
    Ok(())
}

/// Mutate the cached balance and build the matching entry
fn apply_entry(
    wallet: &mut Wallet,
    kind: EntryKind,
    amount: Decimal,
    reason: EntryReason,
    reference: Option<String>,
    now: DateTime<Utc>,
) -> LedgerEntry {
    match kind {
        EntryKind::Credit => wallet.balance += amount,
        EntryKind::Debit => wallet.balance -= amount,
    }
    wallet.updated_at = now;

    LedgerEntry {
        entry_id: Uuid::now_v7(),
        wallet: wallet.wallet,
        kind,
        amount,
        unit: wallet.unit.clone(),
        reason,
        reference,
        balance_after: wallet.balance,
        created_at: now,
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl std::fmt::Debug for LedgerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Debit a wallet
    pub async fn debit(
        &self,
        wallet: WalletRef,
        amount: Decimal,
        reason: EntryReason,
        reference: Option<String>,
    ) -> Result<DebitOutcome> {
        self.request(|response| LedgerMessage::Debit { wallet, amount, reason, reference, response })
            .await
    }

    /// Credit a wallet
    pub async fn credit(
        &self,
        wallet: WalletRef,
        amount: Decimal,
        reason: EntryReason,
        reference: Option<String>,
    ) -> Result<(Wallet, LedgerEntry)> {
        self.request(|response| LedgerMessage::Credit { wallet, amount, reason, reference, response })
            .await
    }

    /// Replace wallet policy
    pub async fn configure(&self, wallet: WalletRef, settings: WalletSettings) -> Result<Wallet> {
        self.request(|response| LedgerMessage::Configure { wallet, settings, response })
            .await
    }

    /// Reserve pool credits
    pub async fn reserve(
        &self,
        buyer: TenantId,
        payment_ref: String,
        credits: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<PoolReservation> {
        self.request(|response| LedgerMessage::Reserve {
            buyer,
            payment_ref,
            credits,
            expires_at,
            response,
        })
        .await
    }

    /// Capture a reservation
    pub async fn capture(&self, payment_ref: String) -> Result<PoolReservation> {
        self.request(|response| LedgerMessage::Capture { payment_ref, response })
            .await
    }

    /// Cancel a reservation
    pub async fn cancel(&self, payment_ref: String) -> Result<PoolReservation> {
        self.request(|response| LedgerMessage::Cancel { payment_ref, response })
            .await
    }

    /// Sweep expired reservations
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<PoolReservation>> {
        self.request(|response| LedgerMessage::Sweep { now, response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    storage: Storage,
    sink: Arc<dyn EventSink>,
    metrics: Metrics,
    unit: String,
    operator: TenantId,
    mailbox_capacity: usize,
) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = LedgerActor::new(storage, rx, sink, metrics, unit, operator);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}
