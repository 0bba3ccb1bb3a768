//! Document state machine
//!
//! Tenant-facing entry points (create, cancel, retry) run through the
//! idempotency guard. Every status change is a guarded transition on the
//! document store, so a stale caller gets `InvalidStateTransition` instead
//! of silently overwriting newer state.

use crate::config::{ChargingModel, EngineConfig};
use crate::limits::{day_start, month_start, DocumentCounts, LimitChecker};
use crate::metrics::{DOCUMENTS_CREATED_TOTAL, REQUEUES_TOTAL};
use crate::store::DocumentStore;
use crate::types::{Document, DocumentQuery, DocumentStatus, NewDocument};
use crate::validator::PayloadValidator;
use crate::{Error, Result};
use chrono::Utc;
use idempotency::{fingerprint, Executed, IdempotencyGuard, IdempotencyKey, Scope};
use ledger_core::pagination::{paginate, Page, PageResult};
use ledger_core::storage::uuid_v7_time;
use ledger_core::{EventSink, Ledger, TenantId, WalletRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Idempotency scope of document creation
pub const ENDPOINT_CREATE: &str = "documents.create";
/// Idempotency scope of cancellation
pub const ENDPOINT_CANCEL: &str = "documents.cancel";
/// Idempotency scope of tenant retry
pub const ENDPOINT_RETRY: &str = "documents.retry";

/// Document engine
#[derive(Clone)]
pub struct DocumentEngine {
    pub(crate) store: DocumentStore,
    pub(crate) ledger: Ledger,
    pub(crate) guard: IdempotencyGuard,
    validator: Arc<dyn PayloadValidator>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) wake: Arc<Notify>,
    create_locks: Arc<Mutex<HashMap<TenantId, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for DocumentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DocumentEngine {
    /// Create engine over the ledger's storage.
    ///
    /// `sink` receives `document.*` and `ledger.debit_failed` events; pass
    /// the same sink the ledger publishes to.
    pub fn new(
        ledger: Ledger,
        guard: IdempotencyGuard,
        validator: Arc<dyn PayloadValidator>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store: DocumentStore::new(ledger.storage().clone()),
            ledger,
            guard,
            validator,
            sink,
            config: Arc::new(config),
            wake: Arc::new(Notify::new()),
            create_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Wallet charged for `tenant_id`'s documents
    pub fn charged_wallet(&self, tenant_id: TenantId) -> WalletRef {
        match self.config.charging {
            ChargingModel::Direct => WalletRef::main(tenant_id),
            ChargingModel::Pooled => WalletRef::e_credit(tenant_id),
        }
    }

    /// Accept a document into the queue, exactly once per key.
    ///
    /// A repeat with the same key and body replays the first response.
    pub async fn create(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        request: NewDocument,
    ) -> Result<Executed<Document>> {
        let body = serde_json::to_vec(&request)?;
        let fingerprint = fingerprint("POST", "/documents", &body);
        let scope = Scope::new(tenant_id, ENDPOINT_CREATE);

        self.guard
            .execute(&scope, key, &fingerprint, || async move {
                self.create_document(tenant_id, request)
            })
            .await
    }

    fn create_document(&self, tenant_id: TenantId, request: NewDocument) -> Result<Document> {
        self.validator.validate(request.kind, &request.payload)?;
        let payload = serde_json::to_string(&request.payload)?;

        // Count and insert under the tenant's lock so concurrent creates
        // cannot both squeeze under a blocking limit
        let tenant_lock = self.tenant_lock(tenant_id);
        let _guard = tenant_lock.lock();

        let document_id = Uuid::now_v7();
        let now = uuid_v7_time(&document_id).unwrap_or_else(Utc::now);
        let wallet = self.ledger.get_wallet(self.charged_wallet(tenant_id))?;
        let counts = DocumentCounts {
            today: self.store.count_created_since(tenant_id, day_start(now))?,
            this_month: self.store.count_created_since(tenant_id, month_start(now))?,
        };
        LimitChecker::new(wallet.settings).check(tenant_id, counts)?;

        let document = Document {
            document_id,
            tenant_id,
            kind: request.kind,
            status: DocumentStatus::Queued,
            provider_ref: None,
            external_reference: request.external_reference,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            payload,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&document)?;

        DOCUMENTS_CREATED_TOTAL
            .with_label_values(&[document.kind.as_str()])
            .inc();
        tracing::info!(
            document = %document.document_id,
            tenant = %tenant_id,
            kind = %document.kind,
            "Document queued"
        );

        self.wake.notify_one();
        Ok(document)
    }

    fn tenant_lock(&self, tenant_id: TenantId) -> Arc<Mutex<()>> {
        self.create_locks
            .lock()
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Get a document
    pub fn get(&self, document_id: Uuid) -> Result<Option<Document>> {
        self.store.get(document_id)
    }

    /// Get a document owned by `tenant_id`
    pub fn get_for_tenant(&self, tenant_id: TenantId, document_id: Uuid) -> Result<Document> {
        self.store
            .get(document_id)?
            .filter(|d| d.tenant_id == tenant_id)
            .ok_or(Error::DocumentNotFound(document_id))
    }

    /// Documents matching `query`, newest first
    pub fn list(&self, query: &DocumentQuery, page: &Page) -> Result<PageResult<Document>> {
        let rows = match query.tenant_id {
            Some(tenant_id) => self.store.tenant_documents(tenant_id)?,
            None => self.store.documents()?,
        };
        let rows = rows.into_iter().filter(|d| query.matches(d)).collect();
        Ok(paginate(rows, page, |d| d.document_id)?)
    }

    /// Cancel a queued document, or one waiting for a retry.
    ///
    /// A document claimed by a running dispatch attempt is rejected with
    /// `Conflict`; terminal and failed documents with
    /// `InvalidStateTransition`.
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        document_id: Uuid,
    ) -> Result<Executed<Document>> {
        let fingerprint = fingerprint("POST", &format!("/documents/{}/cancel", document_id), &[]);
        let scope = Scope::new(tenant_id, ENDPOINT_CANCEL);

        self.guard
            .execute(&scope, key, &fingerprint, || async move {
                self.cancel_document(tenant_id, document_id)
            })
            .await
    }

    fn cancel_document(&self, tenant_id: TenantId, document_id: Uuid) -> Result<Document> {
        let current = self.get_for_tenant(tenant_id, document_id)?;

        let document = self.store.transition(
            document_id,
            current.status,
            DocumentStatus::Canceled,
            |d, _| {
                if d.is_in_flight() {
                    return Err(Error::Conflict(format!(
                        "document {} is being dispatched",
                        document_id
                    )));
                }
                d.next_attempt_at = None;
                Ok(())
            },
        )?;

        tracing::info!(document = %document_id, tenant = %tenant_id, "Document canceled");
        Ok(document)
    }

    /// Put a failed document back into the queue with a fresh retry budget
    pub async fn retry(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        document_id: Uuid,
    ) -> Result<Executed<Document>> {
        let fingerprint = fingerprint("POST", &format!("/documents/{}/retry", document_id), &[]);
        let scope = Scope::new(tenant_id, ENDPOINT_RETRY);

        self.guard
            .execute(&scope, key, &fingerprint, || async move {
                self.get_for_tenant(tenant_id, document_id)?;
                self.requeue(document_id, "tenant")
            })
            .await
    }

    /// `failed → queued`: resets the attempt budget and drops the document's
    /// dead letter in the same write
    pub(crate) fn requeue(&self, document_id: Uuid, source: &str) -> Result<Document> {
        let document = self.store.transition(
            document_id,
            DocumentStatus::Failed,
            DocumentStatus::Queued,
            |d, batch| {
                d.attempt_count = 0;
                d.next_attempt_at = None;
                d.last_error = None;
                self.store.stage_dead_letter_removal(batch, d.document_id)?;
                Ok(())
            },
        )?;

        REQUEUES_TOTAL.with_label_values(&[source]).inc();
        tracing::info!(document = %document_id, source, "Document requeued");

        self.wake.notify_one();
        Ok(document)
    }

    /// Record the externally issued reference a despatch needs before it
    /// can be requeued
    pub fn set_external_reference(
        &self,
        tenant_id: TenantId,
        document_id: Uuid,
        reference: impl Into<String>,
    ) -> Result<Document> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(Error::Validation("external reference cannot be empty".to_string()));
        }
        self.get_for_tenant(tenant_id, document_id)?;

        let (document, _) = self.store.update(document_id, |d| {
            if d.status.is_terminal() {
                return Err(Error::Conflict(format!(
                    "document {} is {}",
                    document_id, d.status
                )));
            }
            d.external_reference = Some(reference);
            Ok(true)
        })?;
        Ok(document)
    }
}
