//! Dead-letter operations
//!
//! A dead letter is the durable "stop retrying" record of a document that
//! failed dispatch. Operators list, delete or retry them; bulk requeue
//! reports partial success instead of aborting on the first bad item.

use crate::engine::DocumentEngine;
use crate::types::{BulkFilter, BulkOutcome, DeadLetter, Document, DocumentStatus};
use crate::{Error, Result};
use ledger_core::pagination::{paginate, Page, PageResult};
use uuid::Uuid;

impl DocumentEngine {
    /// Dead letters matching `filter`, newest first
    pub fn list_dead_letters(&self, filter: &BulkFilter, page: &Page) -> Result<PageResult<DeadLetter>> {
        let rows = self
            .store
            .dead_letters()?
            .into_iter()
            .filter(|dl| filter.matches(dl.work_type, dl.tenant_id, dl.created_at))
            .collect();
        Ok(paginate(rows, page, |dl| dl.dead_letter_id)?)
    }

    /// Get a dead letter
    pub fn get_dead_letter(&self, dead_letter_id: Uuid) -> Result<Option<DeadLetter>> {
        self.store.get_dead_letter(dead_letter_id)
    }

    /// Drop a dead letter without touching its document
    pub fn delete_dead_letter(&self, dead_letter_id: Uuid) -> Result<()> {
        if !self.store.delete_dead_letter(dead_letter_id)? {
            return Err(Error::DeadLetterNotFound(dead_letter_id));
        }
        tracing::info!(dead_letter = %dead_letter_id, "Dead letter deleted");
        Ok(())
    }

    /// Requeue the document behind a dead letter.
    ///
    /// Fails with `RetryNotSupported` when the document kind cannot be
    /// resubmitted in its current shape; the dead letter is kept.
    pub fn retry_dead_letter(&self, dead_letter_id: Uuid) -> Result<Document> {
        let dead_letter = self
            .store
            .get_dead_letter(dead_letter_id)?
            .ok_or(Error::DeadLetterNotFound(dead_letter_id))?;
        let document = self
            .store
            .get(dead_letter.reference_id)?
            .ok_or(Error::DocumentNotFound(dead_letter.reference_id))?;

        ensure_requeueable(&document)?;
        self.requeue(document.document_id, "dead_letter")
    }

    /// Retry every dead letter matching `filter`
    pub fn bulk_requeue_dead_letters(&self, filter: &BulkFilter) -> Result<BulkOutcome> {
        let candidates: Vec<Uuid> = self
            .store
            .dead_letters()?
            .into_iter()
            .filter(|dl| filter.matches(dl.work_type, dl.tenant_id, dl.created_at))
            .map(|dl| dl.dead_letter_id)
            .collect();

        let outcome = collect_outcome(candidates, |id| self.retry_dead_letter(id));
        tracing::info!(
            requeued = outcome.requeued,
            failed = outcome.failed.len(),
            filter = ?filter,
            "Dead letter bulk requeue"
        );
        Ok(outcome)
    }

    /// Requeue every `failed` document matching `filter`
    pub fn bulk_requeue_failed(&self, filter: &BulkFilter) -> Result<BulkOutcome> {
        let rows = match filter.tenant_id {
            Some(tenant_id) => self.store.tenant_documents(tenant_id)?,
            None => self.store.documents()?,
        };
        let candidates: Vec<Uuid> = rows
            .into_iter()
            .filter(|d| d.status == DocumentStatus::Failed)
            .filter(|d| filter.matches(d.kind, d.tenant_id, d.created_at))
            .map(|d| d.document_id)
            .collect();

        let outcome = collect_outcome(candidates, |id| {
            let document = self.store.get(id)?.ok_or(Error::DocumentNotFound(id))?;
            ensure_requeueable(&document)?;
            self.requeue(id, "bulk")
        });
        tracing::info!(
            requeued = outcome.requeued,
            failed = outcome.failed.len(),
            filter = ?filter,
            "Failed document bulk requeue"
        );
        Ok(outcome)
    }
}

fn ensure_requeueable(document: &Document) -> Result<()> {
    if document.kind.requires_external_reference() && document.external_reference.is_none() {
        return Err(Error::RetryNotSupported {
            document_id: document.document_id,
            reason: format!("{} has no external reference", document.kind),
        });
    }
    Ok(())
}

fn collect_outcome<F>(ids: Vec<Uuid>, mut requeue: F) -> BulkOutcome
where
    F: FnMut(Uuid) -> Result<Document>,
{
    let mut outcome = BulkOutcome::default();
    for id in ids {
        match requeue(id) {
            Ok(_) => outcome.requeued += 1,
            Err(e) => {
                tracing::warn!(item = %id, error = %e, "Requeue skipped item");
                outcome.failed.push((id, e.to_string()));
            }
        }
    }
    outcome
}
