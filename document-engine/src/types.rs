//! Core types for the document engine

use chrono::{DateTime, Utc};
use ledger_core::{EntryReason, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Document kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// E-invoice
    Invoice,
    /// Self-employment / expense voucher
    Voucher,
    /// Despatch advice
    Despatch,
}

impl DocumentKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::Voucher => "voucher",
            DocumentKind::Despatch => "despatch",
        }
    }

    /// Ledger reason recorded when this kind is charged
    pub fn entry_reason(&self) -> EntryReason {
        match self {
            DocumentKind::Invoice => EntryReason::InvoiceSent,
            DocumentKind::Voucher => EntryReason::VoucherSent,
            DocumentKind::Despatch => EntryReason::DespatchSent,
        }
    }

    /// Needs an externally issued reference before it can be requeued from
    /// a dead letter
    pub fn requires_external_reference(&self) -> bool {
        matches!(self, DocumentKind::Despatch)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Accepted, waiting for dispatch
    Queued,
    /// Claimed by the dispatch worker (in flight or awaiting a retry)
    Processing,
    /// Accepted by the provider
    Sent,
    /// Rejected or out of retries
    Failed,
    /// Cancelled by the tenant
    Canceled,
}

impl DocumentStatus {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Sent => "sent",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Canceled => "canceled",
        }
    }

    /// No transition leaves this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Sent | DocumentStatus::Canceled)
    }

    /// Edge exists in the state machine. `processing → processing` is a
    /// retry reschedule.
    pub fn can_transition_to(&self, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Processing, Processing)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Queued, Canceled)
                | (Processing, Canceled)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document ID (UUIDv7)
    pub document_id: Uuid,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Kind
    pub kind: DocumentKind,
    /// Status
    pub status: DocumentStatus,
    /// Provider ID, set once sent
    pub provider_ref: Option<String>,
    /// Externally issued reference (required for despatch requeue)
    pub external_reference: Option<String>,
    /// Dispatch attempts in the current retry budget
    pub attempt_count: u32,
    /// Scheduled retry; `None` while queued, in flight or settled
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last dispatch error
    pub last_error: Option<String>,
    /// Opaque JSON payload
    pub payload: String,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Claimed by an attempt that has not reported back
    pub fn is_in_flight(&self) -> bool {
        self.status == DocumentStatus::Processing && self.next_attempt_at.is_none()
    }

    /// Ready for the dispatch worker at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DocumentStatus::Queued => true,
            DocumentStatus::Processing => self.next_attempt_at.map(|at| at <= now).unwrap_or(false),
            _ => false,
        }
    }
}

/// Create request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    /// Kind
    pub kind: DocumentKind,
    /// Payload, validated by the configured validator
    pub payload: serde_json::Value,
    /// Externally issued reference, if already known
    pub external_reference: Option<String>,
}

/// Work that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Dead letter ID (UUIDv7)
    pub dead_letter_id: Uuid,
    /// Work type (the document kind that was being dispatched)
    pub work_type: DocumentKind,
    /// Document ID
    pub reference_id: Uuid,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Final error
    pub error: String,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Provider answer for one dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Durably accepted
    Accepted {
        /// Provider-side ID
        provider_ref: String,
    },
    /// Timeout, 5xx or equivalent: retry with backoff
    Transient(String),
    /// Rejected: do not retry
    Permanent(String),
}

/// Time / kind window for operator bulk operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkFilter {
    /// Work type / document kind
    pub kind: Option<DocumentKind>,
    /// Tenant
    pub tenant_id: Option<TenantId>,
    /// Created at or after
    pub from: Option<DateTime<Utc>>,
    /// Created before
    pub to: Option<DateTime<Utc>>,
}

impl BulkFilter {
    /// Kind, tenant and creation time fall inside the filter
    pub fn matches(&self, kind: DocumentKind, tenant_id: TenantId, created_at: DateTime<Utc>) -> bool {
        self.kind.map_or(true, |k| k == kind)
            && self.tenant_id.map_or(true, |t| t == tenant_id)
            && self.from.map_or(true, |from| created_at >= from)
            && self.to.map_or(true, |to| created_at < to)
    }
}

/// Listing filter for documents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentQuery {
    /// Tenant
    pub tenant_id: Option<TenantId>,
    /// Status
    pub status: Option<DocumentStatus>,
    /// Kind
    pub kind: Option<DocumentKind>,
}

impl DocumentQuery {
    /// Document passes the filter
    pub fn matches(&self, document: &Document) -> bool {
        self.tenant_id.map_or(true, |t| t == document.tenant_id)
            && self.status.map_or(true, |s| s == document.status)
            && self.kind.map_or(true, |k| k == document.kind)
    }
}

/// Package purchase: hold pool credits until the payment settles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    /// Payment provider reference, unique per purchase
    pub payment_ref: String,
    /// Credits bought
    pub credits: u64,
    /// Hold lifetime; the ledger default when unset
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Partial-success report of a bulk operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// Items requeued
    pub requeued: usize,
    /// Items that could not be requeued, with the reason
    pub failed: Vec<(Uuid, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use DocumentStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Sent));
        assert!(Failed.can_transition_to(Queued));
        assert!(!Sent.can_transition_to(Queued));
        assert!(!Canceled.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Canceled));
        assert!(!Queued.can_transition_to(Sent));
    }

    #[test]
    fn test_terminal_states() {
        assert!(DocumentStatus::Sent.is_terminal());
        assert!(DocumentStatus::Canceled.is_terminal());
        assert!(!DocumentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_only_despatch_needs_reference() {
        assert!(DocumentKind::Despatch.requires_external_reference());
        assert!(!DocumentKind::Invoice.requires_external_reference());
        assert_eq!(DocumentKind::Voucher.entry_reason(), EntryReason::VoucherSent);
    }

    fn any_status() -> impl proptest::strategy::Strategy<Value = DocumentStatus> {
        proptest::sample::select(vec![
            DocumentStatus::Queued,
            DocumentStatus::Processing,
            DocumentStatus::Sent,
            DocumentStatus::Failed,
            DocumentStatus::Canceled,
        ])
    }

    proptest::proptest! {
        #[test]
        fn prop_terminal_states_have_no_exits(from in any_status(), to in any_status()) {
            if from.is_terminal() {
                proptest::prop_assert!(!from.can_transition_to(to));
            }
        }

        #[test]
        fn prop_only_dispatch_reaches_sent(from in any_status()) {
            proptest::prop_assert_eq!(
                from.can_transition_to(DocumentStatus::Sent),
                from == DocumentStatus::Processing
            );
        }
    }
}
