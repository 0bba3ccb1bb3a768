//! Durable document and dead-letter rows

use crate::types::{DeadLetter, Document, DocumentStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::storage::{
    due_key, key_suffix_id, prefix_end, uuid_v7_floor, Storage, WriteBatch, CF_DEAD_LETTERS,
    CF_DEAD_LETTER_INDEX, CF_DISPATCH_QUEUE, CF_DOCUMENTS, CF_DOCUMENT_TENANTS,
};
use ledger_core::TenantId;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Document rows over shared storage.
///
/// Both tables are keyed by UUIDv7, so a full scan is creation order.
/// Three side families follow the rows in the same batch:
///
/// - `document_tenants`: `tenant || document_id`, for per-tenant counts and listings
/// - `dispatch_queue`: `due_at || document_id` for every document the worker may pick up
/// - `dead_letter_index`: `document_id → dead_letter_id`
///
/// Every status change goes through [`DocumentStore::transition`], which
/// compares the current status and writes the new row together with any
/// staged side rows in one batch, all under one lock.
#[derive(Clone)]
pub struct DocumentStore {
    storage: Storage,
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").finish_non_exhaustive()
    }
}

fn tenant_key(tenant_id: TenantId, document_id: Uuid) -> Vec<u8> {
    let mut key = tenant_id.as_bytes().to_vec();
    key.extend_from_slice(document_id.as_bytes());
    key
}

/// Position in the dispatch queue: queued documents from when they entered
/// the queue, scheduled retries from their due time
fn queue_key(document: &Document) -> Option<Vec<u8>> {
    match (document.status, document.next_attempt_at) {
        (DocumentStatus::Queued, _) => Some(due_key(document.updated_at, document.document_id)),
        (DocumentStatus::Processing, Some(at)) => Some(due_key(at, document.document_id)),
        _ => None,
    }
}

fn stage_row(batch: &mut WriteBatch, before: Option<&Document>, after: &Document) -> Result<()> {
    let old_slot = before.and_then(queue_key);
    let new_slot = queue_key(after);
    if old_slot != new_slot {
        if let Some(key) = old_slot {
            batch.delete(CF_DISPATCH_QUEUE, key);
        }
        if let Some(key) = new_slot {
            batch.put(CF_DISPATCH_QUEUE, key, Vec::new());
        }
    }
    batch.put_value(CF_DOCUMENTS, after.document_id.as_bytes().to_vec(), after)?;
    Ok(())
}

impl DocumentStore {
    /// Create store
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Insert a new document
    pub fn insert(&self, document: &Document) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            CF_DOCUMENT_TENANTS,
            tenant_key(document.tenant_id, document.document_id),
            Vec::new(),
        );
        stage_row(&mut batch, None, document)?;
        self.storage.write(batch)?;
        Ok(())
    }

    /// Get a document
    pub fn get(&self, document_id: Uuid) -> Result<Option<Document>> {
        Ok(self.storage.get_value(CF_DOCUMENTS, document_id.as_bytes())?)
    }

    /// All documents, oldest first
    pub fn documents(&self) -> Result<Vec<Document>> {
        Ok(self.storage.scan_values(CF_DOCUMENTS, &[])?)
    }

    /// Documents of one tenant, oldest first
    pub fn tenant_documents(&self, tenant_id: TenantId) -> Result<Vec<Document>> {
        let prefix = tenant_id.as_bytes();
        let keys = self
            .storage
            .scan_range_keys(CF_DOCUMENT_TENANTS, prefix, &prefix_end(prefix), usize::MAX)?;

        let mut documents = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(document) = key_suffix_id(&key).map(|id| self.get(id)).transpose()?.flatten() {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    /// Documents of `tenant_id` whose id was minted at or after `since`.
    ///
    /// Only walks the tenant's index from `since` on; callers stamp
    /// `created_at` from the id so the two agree.
    pub fn count_created_since(&self, tenant_id: TenantId, since: DateTime<Utc>) -> Result<u32> {
        let prefix = tenant_id.as_bytes();
        let start = tenant_key(tenant_id, uuid_v7_floor(since));
        let keys = self
            .storage
            .scan_range_keys(CF_DOCUMENT_TENANTS, &start, &prefix_end(prefix), usize::MAX)?;
        Ok(keys.len() as u32)
    }

    /// Up to `limit` documents in the dispatch queue due at `now`, earliest first
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        Ok(self.storage.due_ids(CF_DISPATCH_QUEUE, now, limit)?)
    }

    /// Guarded status change.
    ///
    /// Fails with `InvalidStateTransition` unless the row is in `expected`
    /// and the edge `expected → to` exists. `mutate` runs under the lock
    /// after the check; it may edit the row, stage extra writes, or abort
    /// with an error, in which case nothing is written.
    pub fn transition<F>(
        &self,
        document_id: Uuid,
        expected: DocumentStatus,
        to: DocumentStatus,
        mutate: F,
    ) -> Result<Document>
    where
        F: FnOnce(&mut Document, &mut WriteBatch) -> Result<()>,
    {
        if !expected.can_transition_to(to) {
            return Err(Error::InvalidStateTransition { from: expected, to });
        }

        let _guard = self.lock.lock();

        let current = self
            .get(document_id)?
            .ok_or(Error::DocumentNotFound(document_id))?;
        if current.status != expected {
            return Err(Error::InvalidStateTransition {
                from: current.status,
                to,
            });
        }

        let mut document = current.clone();
        let mut batch = WriteBatch::new();
        mutate(&mut document, &mut batch)?;
        document.status = to;
        document.updated_at = Utc::now();

        stage_row(&mut batch, Some(&current), &document)?;
        self.storage.write(batch)?;

        tracing::debug!(
            document = %document_id,
            from = %expected,
            to = %to,
            "Document transitioned"
        );
        Ok(document)
    }

    /// Edit a row without changing its status. `apply` returns `false` to
    /// leave the row untouched.
    pub fn update<F>(&self, document_id: Uuid, apply: F) -> Result<(Document, bool)>
    where
        F: FnOnce(&mut Document) -> Result<bool>,
    {
        let _guard = self.lock.lock();

        let current = self
            .get(document_id)?
            .ok_or(Error::DocumentNotFound(document_id))?;
        let mut document = current.clone();
        if !apply(&mut document)? {
            return Ok((current, false));
        }
        document.status = current.status;
        // Keep a queued document's place in line
        document.updated_at = match current.status {
            DocumentStatus::Queued => current.updated_at,
            _ => Utc::now(),
        };

        let mut batch = WriteBatch::new();
        stage_row(&mut batch, Some(&current), &document)?;
        self.storage.write(batch)?;
        Ok((document, true))
    }

    /// Stage a dead letter for `document`, replacing any earlier one
    pub fn stage_dead_letter(&self, batch: &mut WriteBatch, dead_letter: &DeadLetter) -> Result<()> {
        if let Some(existing) = self.dead_letter_id_for(dead_letter.reference_id)? {
            batch.delete(CF_DEAD_LETTERS, existing.as_bytes().to_vec());
        }
        batch.put_value(
            CF_DEAD_LETTERS,
            dead_letter.dead_letter_id.as_bytes().to_vec(),
            dead_letter,
        )?;
        batch.put(
            CF_DEAD_LETTER_INDEX,
            dead_letter.reference_id.as_bytes().to_vec(),
            dead_letter.dead_letter_id.as_bytes().to_vec(),
        );
        Ok(())
    }

    /// Stage removal of the dead letter of `document_id`, if any
    pub fn stage_dead_letter_removal(&self, batch: &mut WriteBatch, document_id: Uuid) -> Result<Option<Uuid>> {
        let existing = self.dead_letter_id_for(document_id)?;
        if let Some(dead_letter_id) = existing {
            batch.delete(CF_DEAD_LETTERS, dead_letter_id.as_bytes().to_vec());
            batch.delete(CF_DEAD_LETTER_INDEX, document_id.as_bytes().to_vec());
        }
        Ok(existing)
    }

    /// Get a dead letter
    pub fn get_dead_letter(&self, dead_letter_id: Uuid) -> Result<Option<DeadLetter>> {
        Ok(self
            .storage
            .get_value(CF_DEAD_LETTERS, dead_letter_id.as_bytes())?)
    }

    fn dead_letter_id_for(&self, document_id: Uuid) -> Result<Option<Uuid>> {
        let raw: Option<Vec<u8>> = self
            .storage
            .get_raw(CF_DEAD_LETTER_INDEX, document_id.as_bytes())?;
        Ok(raw.and_then(|bytes| Uuid::from_slice(&bytes).ok()))
    }

    /// Dead letter of a document
    pub fn dead_letter_for(&self, document_id: Uuid) -> Result<Option<DeadLetter>> {
        match self.dead_letter_id_for(document_id)? {
            Some(dead_letter_id) => self.get_dead_letter(dead_letter_id),
            None => Ok(None),
        }
    }

    /// All dead letters, oldest first
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.storage.scan_values(CF_DEAD_LETTERS, &[])?)
    }

    /// Remove a dead letter. Returns `false` if it did not exist.
    pub fn delete_dead_letter(&self, dead_letter_id: Uuid) -> Result<bool> {
        let _guard = self.lock.lock();

        let Some(dead_letter) = self.get_dead_letter(dead_letter_id)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::new();
        batch.delete(CF_DEAD_LETTERS, dead_letter_id.as_bytes().to_vec());
        batch.delete(CF_DEAD_LETTER_INDEX, dead_letter.reference_id.as_bytes().to_vec());
        self.storage.write(batch)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentKind;

    fn queued(tenant_id: TenantId) -> Document {
        let now = Utc::now();
        Document {
            document_id: Uuid::now_v7(),
            tenant_id,
            kind: DocumentKind::Invoice,
            status: DocumentStatus::Queued,
            provider_ref: None,
            external_reference: None,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            payload: "{}".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn dead_letter(document: &Document, error: &str) -> DeadLetter {
        DeadLetter {
            dead_letter_id: Uuid::now_v7(),
            work_type: document.kind,
            reference_id: document.document_id,
            tenant_id: document.tenant_id,
            error: error.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_transition_checks_current_status() {
        let store = DocumentStore::new(Storage::in_memory());
        let doc = queued(TenantId::new());
        store.insert(&doc).unwrap();

        let claimed = store
            .transition(doc.document_id, DocumentStatus::Queued, DocumentStatus::Processing, |_, _| Ok(()))
            .unwrap();
        assert_eq!(claimed.status, DocumentStatus::Processing);

        // Stale expectation
        let err = store
            .transition(doc.document_id, DocumentStatus::Queued, DocumentStatus::Canceled, |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition {
                from: DocumentStatus::Processing,
                to: DocumentStatus::Canceled
            }
        ));
    }

    #[test]
    fn test_illegal_edge_writes_nothing() {
        let store = DocumentStore::new(Storage::in_memory());
        let doc = queued(TenantId::new());
        store.insert(&doc).unwrap();

        let err = store
            .transition(doc.document_id, DocumentStatus::Queued, DocumentStatus::Sent, |d, _| {
                d.provider_ref = Some("nope".into());
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(store.get(doc.document_id).unwrap().unwrap(), doc);
    }

    #[test]
    fn test_aborted_mutation_writes_nothing() {
        let store = DocumentStore::new(Storage::in_memory());
        let doc = queued(TenantId::new());
        store.insert(&doc).unwrap();

        let err = store
            .transition(doc.document_id, DocumentStatus::Queued, DocumentStatus::Canceled, |_, _| {
                Err(Error::Conflict("fenced".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.get(doc.document_id).unwrap().unwrap().status, DocumentStatus::Queued);
    }

    #[test]
    fn test_one_dead_letter_per_document() {
        let store = DocumentStore::new(Storage::in_memory());
        let doc = queued(TenantId::new());
        store.insert(&doc).unwrap();

        for error in ["first", "second"] {
            let mut batch = WriteBatch::new();
            store.stage_dead_letter(&mut batch, &dead_letter(&doc, error)).unwrap();
            store.storage.write(batch).unwrap();
        }

        let all = store.dead_letters().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].error, "second");

        assert!(store.delete_dead_letter(all[0].dead_letter_id).unwrap());
        assert!(!store.delete_dead_letter(all[0].dead_letter_id).unwrap());
        assert!(store.dead_letter_for(doc.document_id).unwrap().is_none());
    }

    #[test]
    fn test_dispatch_queue_follows_status() {
        let store = DocumentStore::new(Storage::in_memory());
        let doc = queued(TenantId::new());
        store.insert(&doc).unwrap();
        let now = Utc::now();
        assert_eq!(store.due(now, 10).unwrap(), vec![doc.document_id]);

        // Claimed: off the queue while the attempt is in flight
        store
            .transition(doc.document_id, DocumentStatus::Queued, DocumentStatus::Processing, |_, _| Ok(()))
            .unwrap();
        assert!(store.due(now, 10).unwrap().is_empty());

        // Retry scheduled an hour out
        let retry_at = now + chrono::Duration::hours(1);
        store
            .transition(doc.document_id, DocumentStatus::Processing, DocumentStatus::Processing, |d, _| {
                d.next_attempt_at = Some(retry_at);
                Ok(())
            })
            .unwrap();
        assert!(store.due(now, 10).unwrap().is_empty());
        assert_eq!(store.due(retry_at, 10).unwrap(), vec![doc.document_id]);

        store
            .transition(doc.document_id, DocumentStatus::Processing, DocumentStatus::Canceled, |d, _| {
                d.next_attempt_at = None;
                Ok(())
            })
            .unwrap();
        assert!(store.due(retry_at, 10).unwrap().is_empty());
    }

    #[test]
    fn test_due_skips_settled_history() {
        let store = DocumentStore::new(Storage::in_memory());
        let tenant = TenantId::new();
        for _ in 0..5 {
            let doc = queued(tenant);
            store.insert(&doc).unwrap();
            store
                .transition(doc.document_id, DocumentStatus::Queued, DocumentStatus::Canceled, |_, _| Ok(()))
                .unwrap();
        }
        let live = queued(tenant);
        store.insert(&live).unwrap();

        assert_eq!(store.due(Utc::now(), 1).unwrap(), vec![live.document_id]);
    }

    #[test]
    fn test_tenant_index_counts_only_own_recent_documents() {
        let store = DocumentStore::new(Storage::in_memory());
        let tenant = TenantId::new();
        let other = TenantId::new();

        let since = Utc::now();
        for _ in 0..3 {
            store.insert(&queued(tenant)).unwrap();
        }
        store.insert(&queued(other)).unwrap();

        assert_eq!(store.count_created_since(tenant, since).unwrap(), 3);
        assert_eq!(store.count_created_since(other, since).unwrap(), 1);
        assert_eq!(
            store
                .count_created_since(tenant, Utc::now() + chrono::Duration::seconds(1))
                .unwrap(),
            0
        );
        assert_eq!(store.tenant_documents(tenant).unwrap().len(), 3);
        assert!(store.tenant_documents(TenantId::new()).unwrap().is_empty());
    }

    #[test]
    fn test_dead_letter_index_tracks_replacement_and_removal() {
        let store = DocumentStore::new(Storage::in_memory());
        let doc = queued(TenantId::new());
        store.insert(&doc).unwrap();

        let first = dead_letter(&doc, "first");
        let mut batch = WriteBatch::new();
        store.stage_dead_letter(&mut batch, &first).unwrap();
        store.storage.write(batch).unwrap();
        assert_eq!(store.dead_letter_for(doc.document_id).unwrap().unwrap().error, "first");

        let mut batch = WriteBatch::new();
        let removed = store.stage_dead_letter_removal(&mut batch, doc.document_id).unwrap();
        store.storage.write(batch).unwrap();
        assert_eq!(removed, Some(first.dead_letter_id));
        assert!(store.dead_letter_for(doc.document_id).unwrap().is_none());
        assert!(store.get_dead_letter(first.dead_letter_id).unwrap().is_none());
    }
}
