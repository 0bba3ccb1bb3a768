//! Dispatch worker
//!
//! Claims due documents with a guarded `queued|processing → processing`
//! update, calls the provider gateway with no lock held, then settles the
//! outcome with another guarded transition:
//!
//! - accepted: `sent`, then the ledger debit for billable kinds
//! - transient: reschedule on the backoff ladder, or `failed` + dead letter
//!   once the retry ceiling is exceeded
//! - permanent: `failed` + dead letter immediately

use crate::engine::DocumentEngine;
use crate::gateway::{HttpProviderGateway, ProviderGateway};
use crate::metrics::{DEAD_LETTERS_TOTAL, DISPATCH_ATTEMPTS_TOTAL, DISPATCH_DURATION};
use crate::types::{DeadLetter, DispatchOutcome, Document, DocumentStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ledger_core::{topics, DomainEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;
use webhook_engine::RetrySchedule;

/// Dispatch worker
#[derive(Clone)]
pub struct DispatchWorker {
    engine: DocumentEngine,
    gateway: Arc<dyn ProviderGateway>,
    schedule: RetrySchedule,
}

impl std::fmt::Debug for DispatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchWorker")
            .field("gateway", &self.gateway.name())
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl DispatchWorker {
    /// Create worker with an explicit gateway
    pub fn new(engine: DocumentEngine, gateway: Arc<dyn ProviderGateway>) -> Self {
        let schedule = RetrySchedule::from_secs(&engine.config.retry_ladder_secs);
        Self {
            engine,
            gateway,
            schedule,
        }
    }

    /// Create worker submitting over HTTP
    pub fn with_http(engine: DocumentEngine) -> Result<Self> {
        let gateway = HttpProviderGateway::new(engine.config.gateway.clone())?;
        Ok(Self::new(engine, Arc::new(gateway)))
    }

    /// Dispatch one document if it is due at `now`.
    ///
    /// Returns the document after the attempt, or `None` when it was not
    /// due or another worker claimed it first.
    pub async fn dispatch_at(&self, document_id: Uuid, now: DateTime<Utc>) -> Result<Option<Document>> {
        let Some(claimed) = self.claim(document_id, now)? else {
            return Ok(None);
        };

        let started = Instant::now();
        let outcome = self.gateway.submit(&claimed).await;
        DISPATCH_DURATION.observe(started.elapsed().as_secs_f64());

        let settled = match outcome {
            DispatchOutcome::Accepted { provider_ref } => self.on_accepted(&claimed, provider_ref).await?,
            DispatchOutcome::Transient(error) => self.on_transient(&claimed, error, now)?,
            DispatchOutcome::Permanent(error) => {
                self.record_attempt(&claimed, "permanent");
                self.fail(&claimed, claimed.attempt_count + 1, error)?
            }
        };
        Ok(Some(settled))
    }

    fn claim(&self, document_id: Uuid, now: DateTime<Utc>) -> Result<Option<Document>> {
        let Some(current) = self.engine.store.get(document_id)? else {
            return Err(Error::DocumentNotFound(document_id));
        };
        if !current.is_due(now) {
            return Ok(None);
        }

        let claimed = self.engine.store.transition(
            document_id,
            current.status,
            DocumentStatus::Processing,
            |d, _| {
                if !d.is_due(now) {
                    return Err(Error::Conflict(format!("document {} already claimed", document_id)));
                }
                d.next_attempt_at = None;
                Ok(())
            },
        );

        match claimed {
            Ok(document) => Ok(Some(document)),
            // Lost the race to a cancel or another worker
            Err(Error::InvalidStateTransition { .. }) | Err(Error::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn on_accepted(&self, claimed: &Document, provider_ref: String) -> Result<Document> {
        self.record_attempt(claimed, "accepted");

        let sent = self.engine.store.transition(
            claimed.document_id,
            DocumentStatus::Processing,
            DocumentStatus::Sent,
            |d, _| {
                d.attempt_count += 1;
                d.provider_ref = Some(provider_ref.clone());
                d.next_attempt_at = None;
                d.last_error = None;
                Ok(())
            },
        )?;

        tracing::info!(
            document = %sent.document_id,
            tenant = %sent.tenant_id,
            provider_ref = %provider_ref,
            "Document sent"
        );

        let charged = self.charge(&sent).await;

        self.engine.sink.publish(DomainEvent::new(
            sent.tenant_id,
            topics::DOCUMENT_SENT,
            serde_json::json!({
                "document_id": sent.document_id,
                "kind": sent.kind,
                "provider_ref": provider_ref,
                "charged": charged.map(|amount| amount.to_string()),
            }),
        ));
        Ok(sent)
    }

    /// Debit the charged wallet after acceptance. A failed debit leaves the
    /// document sent and uncharged and raises `ledger.debit_failed`.
    async fn charge(&self, sent: &Document) -> Option<rust_decimal::Decimal> {
        let price = self.engine.config.pricing.price(sent.kind);
        if price.is_zero() {
            return None;
        }

        let wallet = self.engine.charged_wallet(sent.tenant_id);
        match self
            .engine
            .ledger
            .debit_for_document(wallet, price, sent.kind.entry_reason(), sent.document_id.to_string())
            .await
        {
            Ok(_) => Some(price),
            Err(e) => {
                tracing::error!(
                    document = %sent.document_id,
                    wallet = %wallet,
                    amount = %price,
                    error = %e,
                    "Ledger debit failed for sent document"
                );
                self.engine.sink.publish(DomainEvent::new(
                    sent.tenant_id,
                    topics::LEDGER_DEBIT_FAILED,
                    serde_json::json!({
                        "document_id": sent.document_id,
                        "wallet": wallet.to_string(),
                        "amount": price.to_string(),
                        "error": e.to_string(),
                    }),
                ));
                None
            }
        }
    }

    fn on_transient(&self, claimed: &Document, error: String, now: DateTime<Utc>) -> Result<Document> {
        let attempts = claimed.attempt_count + 1;
        if attempts > self.engine.config.max_retries {
            self.record_attempt(claimed, "exhausted");
            return self.fail(claimed, attempts, error);
        }

        self.record_attempt(claimed, "transient");
        let next_attempt_at = now + self.schedule.backoff(attempts);

        let rescheduled = self.engine.store.transition(
            claimed.document_id,
            DocumentStatus::Processing,
            DocumentStatus::Processing,
            |d, _| {
                d.attempt_count = attempts;
                d.next_attempt_at = Some(next_attempt_at);
                d.last_error = Some(error.clone());
                Ok(())
            },
        )?;

        tracing::info!(
            document = %claimed.document_id,
            attempts,
            next_attempt_at = %next_attempt_at,
            error = %error,
            "Dispatch failed, retry scheduled"
        );
        Ok(rescheduled)
    }

    fn fail(&self, claimed: &Document, attempts: u32, error: String) -> Result<Document> {
        let store = &self.engine.store;
        let dead_letter = DeadLetter {
            dead_letter_id: Uuid::now_v7(),
            work_type: claimed.kind,
            reference_id: claimed.document_id,
            tenant_id: claimed.tenant_id,
            error: error.clone(),
            created_at: Utc::now(),
        };

        let failed = store.transition(
            claimed.document_id,
            DocumentStatus::Processing,
            DocumentStatus::Failed,
            |d, batch| {
                d.attempt_count = attempts;
                d.next_attempt_at = None;
                d.last_error = Some(error.clone());
                store.stage_dead_letter(batch, &dead_letter)
            },
        )?;

        DEAD_LETTERS_TOTAL
            .with_label_values(&[failed.kind.as_str()])
            .inc();
        tracing::warn!(
            document = %failed.document_id,
            tenant = %failed.tenant_id,
            attempts,
            error = %error,
            "Document dead-lettered"
        );

        self.engine.sink.publish(DomainEvent::new(
            failed.tenant_id,
            topics::DOCUMENT_FAILED,
            serde_json::json!({
                "document_id": failed.document_id,
                "kind": failed.kind,
                "attempts": attempts,
                "error": error,
            }),
        ));
        Ok(failed)
    }

    fn record_attempt(&self, document: &Document, outcome: &str) {
        DISPATCH_ATTEMPTS_TOTAL
            .with_label_values(&[document.kind.as_str(), outcome])
            .inc();
    }

    /// Dispatch every document due at `now`, bounded by the configured
    /// concurrency. Returns the number of documents picked up.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let worker = &self.engine.config.worker;
        let due = self.engine.store.due(now, worker.batch_size.max(1))?;

        let picked = due.len();
        let results: Vec<Result<Option<Document>>> = stream::iter(due)
            .map(|id| self.dispatch_at(id, now))
            .buffer_unordered(worker.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            if let Err(e) = result {
                tracing::error!(error = %e, "Dispatch outcome could not be recorded");
            }
        }

        Ok(picked)
    }

    /// Make documents orphaned by a crash mid-dispatch due again.
    ///
    /// Only safe before any worker of this store is running. Walks every
    /// row, so it runs once at startup rather than per poll.
    pub fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<usize> {
        let stalled: Vec<Uuid> = self
            .engine
            .store
            .documents()?
            .into_iter()
            .filter(|d| d.is_in_flight())
            .map(|d| d.document_id)
            .collect();

        let mut recovered = 0;
        for document_id in stalled {
            let (_, changed) = self.engine.store.update(document_id, |d| {
                if !d.is_in_flight() {
                    return Ok(false);
                }
                d.next_attempt_at = Some(now);
                Ok(true)
            })?;
            if changed {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Poll for due documents until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self.recover_in_flight(Utc::now()) {
            Ok(0) => {}
            Ok(n) => tracing::warn!(count = n, "Recovered in-flight documents"),
            Err(e) => tracing::error!(error = %e, "Failed to recover in-flight documents"),
        }

        let poll = Duration::from_millis(self.engine.config.worker.poll_interval_ms.max(1));
        let mut interval = tokio::time::interval(poll);
        tracing::info!(gateway = self.gateway.name(), "Dispatch worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.engine.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            if let Err(e) = self.run_due(Utc::now()).await {
                tracing::error!(error = %e, "Dispatch poll failed");
            }
        }

        tracing::info!("Dispatch worker stopped");
    }
}
