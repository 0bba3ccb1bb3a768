//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money and credits)
//! - Time-ordered identifiers (UUIDv7) so storage scans follow creation order

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant (organization) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    /// Generate a fresh tenant ID
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Raw UUID bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which balance of a tenant a wallet holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WalletKind {
    /// Pay-as-you-go balance, debited directly per document
    Main = 1,
    /// Pre-funded e-credit balance, topped up from the pool
    ECredit = 2,
    /// Operator-owned shared pool
    Pool = 3,
}

impl WalletKind {
    /// Stable name used in logs and event payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletKind::Main => "main",
            WalletKind::ECredit => "e_credit",
            WalletKind::Pool => "pool",
        }
    }
}

/// Address of a wallet: owner tenant plus wallet kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletRef {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Wallet kind
    pub kind: WalletKind,
}

impl WalletRef {
    /// Tenant's pay-as-you-go wallet
    pub fn main(tenant_id: TenantId) -> Self {
        Self { tenant_id, kind: WalletKind::Main }
    }

    /// Tenant's e-credit wallet
    pub fn e_credit(tenant_id: TenantId) -> Self {
        Self { tenant_id, kind: WalletKind::ECredit }
    }

    /// Shared pool wallet owned by the operator tenant
    pub fn pool(operator: TenantId) -> Self {
        Self { tenant_id: operator, kind: WalletKind::Pool }
    }

    /// Storage key: tenant bytes || kind byte
    pub fn storage_key(&self) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[..16].copy_from_slice(self.tenant_id.as_bytes());
        key[16] = self.kind as u8;
        key
    }
}

impl fmt::Display for WalletRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.kind.as_str())
    }
}

/// What to do when a document limit is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    /// Reject new documents
    Block,
    /// Accept and log
    #[default]
    Continue,
}

/// Operator-controlled wallet policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSettings {
    /// Low-balance threshold; zero disables the hook
    pub low_balance_threshold: Decimal,
    /// Credit `auto_topup_amount` when the balance falls to the threshold
    pub auto_topup_enabled: bool,
    /// Amount credited by auto top-up
    pub auto_topup_amount: Decimal,
    /// Max documents per UTC day
    pub doc_limit_daily: Option<u32>,
    /// Max documents per UTC month
    pub doc_limit_monthly: Option<u32>,
    /// Behaviour when a limit is reached
    pub limit_action: LimitAction,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            low_balance_threshold: Decimal::ZERO,
            auto_topup_enabled: false,
            auto_topup_amount: Decimal::ZERO,
            doc_limit_daily: None,
            doc_limit_monthly: None,
            limit_action: LimitAction::Continue,
        }
    }
}

/// Wallet with cached balance (entries are the source of truth)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet address
    pub wallet: WalletRef,
    /// Cached running balance
    pub balance: Decimal,
    /// Currency or credit unit
    pub unit: String,
    /// Policy
    pub settings: WalletSettings,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Fresh zero-balance wallet
    pub fn new(wallet: WalletRef, unit: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            wallet,
            balance: Decimal::ZERO,
            unit: unit.into(),
            settings: WalletSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Balance at or below a positive threshold
    pub fn is_low(&self) -> bool {
        let threshold = self.settings.low_balance_threshold;
        threshold > Decimal::ZERO && self.balance <= threshold
    }
}

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Balance increase
    Credit,
    /// Balance decrease
    Debit,
}

/// Why a wallet was mutated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    /// Invoice accepted by the provider
    InvoiceSent,
    /// Voucher accepted by the provider
    VoucherSent,
    /// Despatch advice accepted by the provider
    DespatchSent,
    /// Automatic top-up after a low-balance debit
    AutoTopup,
    /// Operator correction
    ManualAdjustment,
    /// Pool debit when purchased credits move to a tenant
    TransferToCustomer,
    /// Tenant credit when purchased credits arrive
    PackageTopup,
}

impl EntryReason {
    /// Audit tag
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryReason::InvoiceSent => "invoice_sent",
            EntryReason::VoucherSent => "voucher_sent",
            EntryReason::DespatchSent => "despatch_sent",
            EntryReason::AutoTopup => "auto_topup",
            EntryReason::ManualAdjustment => "manual_adjustment",
            EntryReason::TransferToCustomer => "transfer_to_customer",
            EntryReason::PackageTopup => "package_topup",
        }
    }
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, append-only record of one wallet mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,
    /// Wallet mutated
    pub wallet: WalletRef,
    /// Credit or debit
    pub kind: EntryKind,
    /// Always positive
    pub amount: Decimal,
    /// Unit copied from the wallet
    pub unit: String,
    /// Audit reason
    pub reason: EntryReason,
    /// Document or payment that caused it
    pub reference: Option<String>,
    /// Wallet balance after this entry
    pub balance_after: Decimal,
    /// Timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed effect on the balance
    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            EntryKind::Credit => self.amount,
            EntryKind::Debit => -self.amount,
        }
    }
}

/// Pool reservation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Hold outstanding
    Reserved,
    /// Credits transferred to the buyer
    Consumed,
    /// Hold released
    Cancelled,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Consumed => "consumed",
            ReservationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Provisional hold on pool credits while a purchase payment is in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolReservation {
    /// Payment reference (unique)
    pub payment_ref: String,
    /// Tenant buying credits
    pub buyer_tenant_id: TenantId,
    /// Credits held
    pub credits: u64,
    /// Current status
    pub status: ReservationStatus,
    /// Hold expiry
    pub expires_at: DateTime<Utc>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl PoolReservation {
    /// Outstanding hold past its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Reserved && self.expires_at < now
    }
}

/// Pool availability snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAvailability {
    /// Pool wallet balance
    pub balance: Decimal,
    /// Sum of outstanding holds
    pub reserved: Decimal,
    /// `balance - reserved`
    pub available: Decimal,
}

/// Result of a debit
#[derive(Debug, Clone, PartialEq)]
pub struct DebitOutcome {
    /// Wallet after the whole operation (including any top-up)
    pub wallet: Wallet,
    /// The debit entry
    pub entry: LedgerEntry,
    /// Top-up entry, if one was applied
    pub auto_topup: Option<LedgerEntry>,
    /// The debit left the wallet at or below its threshold
    pub low_balance: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_storage_key_distinguishes_kinds() {
        let tenant = TenantId::new();
        assert_ne!(
            WalletRef::main(tenant).storage_key(),
            WalletRef::e_credit(tenant).storage_key()
        );
        assert_eq!(&WalletRef::main(tenant).storage_key()[..16], tenant.as_bytes());
    }

    #[test]
    fn test_low_balance_requires_positive_threshold() {
        let mut wallet = Wallet::new(WalletRef::main(TenantId::new()), "credits", Utc::now());
        assert!(!wallet.is_low());

        wallet.settings.low_balance_threshold = Decimal::from(10);
        wallet.balance = Decimal::from(10);
        assert!(wallet.is_low());

        wallet.balance = Decimal::from(11);
        assert!(!wallet.is_low());
    }

    #[test]
    fn test_reservation_expiry_only_for_reserved() {
        let now = Utc::now();
        let mut reservation = PoolReservation {
            payment_ref: "pay-1".to_string(),
            buyer_tenant_id: TenantId::new(),
            credits: 10,
            status: ReservationStatus::Reserved,
            expires_at: now - chrono::Duration::seconds(1),
            created_at: now,
            updated_at: now,
        };
        assert!(reservation.is_expired(now));

        reservation.status = ReservationStatus::Consumed;
        assert!(!reservation.is_expired(now));
    }
}
