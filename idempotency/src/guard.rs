//! Exactly-once-effective execution of mutating requests
//!
//! A request is claimed by inserting an `in_progress` record under
//! `(tenant, endpoint, key)`. The claim is a compare-and-insert inside one
//! critical section over committed storage, so two concurrent requests with
//! the same key can never both run their handler. The handler itself runs
//! outside the critical section.

use crate::config::IdempotencyConfig;
use crate::key::{IdempotencyKey, Scope};
use crate::metrics;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::storage::{Storage, WriteBatch, CF_IDEMPOTENCY};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Handler running
    InProgress,
    /// Response snapshot stored
    Completed,
}

/// Stored idempotency record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Uniqueness scope
    pub scope: Scope,
    /// Client key
    pub key: IdempotencyKey,
    /// Hash of method, path and body
    pub request_fingerprint: String,
    /// Lifecycle status
    pub status: RecordStatus,
    /// Serialized response, set on completion
    pub response_snapshot: Option<Vec<u8>>,
    /// First seen
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of a guarded execution
#[derive(Debug, Clone, PartialEq)]
pub struct Executed<T> {
    /// Handler result (fresh or replayed)
    pub value: T,
    /// Exact bytes of the stored response
    pub snapshot: Vec<u8>,
    /// True when served from a stored snapshot
    pub replayed: bool,
}

enum Claim {
    Fresh,
    Replay(Vec<u8>),
}

/// Deletes a fresh claim on drop unless disarmed
struct ClaimRelease<'a> {
    guard: &'a IdempotencyGuard,
    record_key: &'a [u8],
    key: &'a IdempotencyKey,
    armed: bool,
}

impl ClaimRelease<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimRelease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.guard.release(self.record_key, self.key);
        }
    }
}

/// Idempotency guard
#[derive(Clone)]
pub struct IdempotencyGuard {
    storage: Storage,
    claim_lock: Arc<Mutex<()>>,
    config: IdempotencyConfig,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    /// Create a guard over shared storage
    pub fn new(storage: Storage, config: IdempotencyConfig) -> Self {
        Self {
            storage,
            claim_lock: Arc::new(Mutex::new(())),
            config,
        }
    }

    /// Run `handler` at most once per `(scope, key)`.
    ///
    /// - first sight: claim, run, snapshot the JSON response
    /// - completed with the same fingerprint: replay the snapshot
    /// - completed with another fingerprint: `IdempotencyConflict`
    /// - still in progress: `ConflictInProgress`
    ///
    /// A failing handler, or a caller dropping this future before the
    /// handler finishes, releases the claim so the client can retry with
    /// the same key.
    pub async fn execute<T, E, F, Fut>(
        &self,
        scope: &Scope,
        key: &IdempotencyKey,
        fingerprint: &str,
        handler: F,
    ) -> std::result::Result<Executed<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let record_key = scope.record_key(key);

        match self.claim(&record_key, scope, key, fingerprint)? {
            Claim::Replay(snapshot) => {
                let value = serde_json::from_slice(&snapshot).map_err(Error::from)?;
                metrics::record_outcome("replayed");
                tracing::debug!(key = %key, endpoint = %scope.endpoint, "Replaying stored response");
                return Ok(Executed { value, snapshot, replayed: true });
            }
            Claim::Fresh => {}
        }

        // Released on every exit until the response is stored, including
        // when this future is dropped while the handler is pending.
        let claim = ClaimRelease {
            guard: self,
            record_key: &record_key,
            key,
            armed: true,
        };

        let value = match handler().await {
            Ok(value) => value,
            Err(e) => {
                metrics::record_outcome("handler_failed");
                return Err(e);
            }
        };

        let snapshot = serde_json::to_vec(&value).map_err(Error::from)?;
        claim.disarm();

        if let Err(e) = self.complete(&record_key, &snapshot) {
            // The side effects already happened; the record stays
            // in_progress until purge so the request is not re-executed.
            tracing::error!(
                key = %key,
                endpoint = %scope.endpoint,
                error = %e,
                "Failed to store idempotent response"
            );
        }

        metrics::record_outcome("executed");
        Ok(Executed { value, snapshot, replayed: false })
    }

    fn claim(
        &self,
        record_key: &[u8],
        scope: &Scope,
        key: &IdempotencyKey,
        fingerprint: &str,
    ) -> Result<Claim> {
        let _guard = self.claim_lock.lock();

        match self
            .storage
            .get_value::<IdempotencyRecord>(CF_IDEMPOTENCY, record_key)?
        {
            None => {
                let record = IdempotencyRecord {
                    scope: scope.clone(),
                    key: key.clone(),
                    request_fingerprint: fingerprint.to_string(),
                    status: RecordStatus::InProgress,
                    response_snapshot: None,
                    created_at: Utc::now(),
                    completed_at: None,
                };
                let mut batch = WriteBatch::new();
                batch.put_value(CF_IDEMPOTENCY, record_key.to_vec(), &record)?;
                self.storage.write(batch)?;
                Ok(Claim::Fresh)
            }
            Some(record) if record.status == RecordStatus::InProgress => {
                metrics::record_outcome("in_progress");
                Err(Error::ConflictInProgress { key: key.to_string() })
            }
            Some(record) if record.request_fingerprint != fingerprint => {
                metrics::record_outcome("conflict");
                tracing::warn!(key = %key, endpoint = %scope.endpoint, "Idempotency key reused with a different request");
                Err(Error::IdempotencyConflict { key: key.to_string() })
            }
            Some(record) => Ok(Claim::Replay(record.response_snapshot.unwrap_or_default())),
        }
    }

    fn complete(&self, record_key: &[u8], snapshot: &[u8]) -> Result<()> {
        let _guard = self.claim_lock.lock();

        let mut record = self
            .storage
            .get_value::<IdempotencyRecord>(CF_IDEMPOTENCY, record_key)?
            .ok_or_else(|| Error::Config("claimed record disappeared".to_string()))?;
        record.status = RecordStatus::Completed;
        record.response_snapshot = Some(snapshot.to_vec());
        record.completed_at = Some(Utc::now());

        let mut batch = WriteBatch::new();
        batch.put_value(CF_IDEMPOTENCY, record_key.to_vec(), &record)?;
        self.storage.write(batch)?;
        Ok(())
    }

    fn release(&self, record_key: &[u8], key: &IdempotencyKey) {
        let _guard = self.claim_lock.lock();

        let mut batch = WriteBatch::new();
        batch.delete(CF_IDEMPOTENCY, record_key.to_vec());
        if let Err(e) = self.storage.write(batch) {
            tracing::error!(key = %key, error = %e, "Failed to release idempotency claim");
        }
    }

    /// Look up a record
    pub fn get(&self, scope: &Scope, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .storage
            .get_value(CF_IDEMPOTENCY, &scope.record_key(key))?)
    }

    /// Remove records created before `now - retention`. Returns the count removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.config.retention();
        let _guard = self.claim_lock.lock();

        let rows = self
            .storage
            .scan_keyed::<IdempotencyRecord>(CF_IDEMPOTENCY, &[])?;
        let mut batch = WriteBatch::new();
        for (record_key, record) in rows {
            if record.created_at < cutoff {
                let status = match record.status {
                    RecordStatus::InProgress => "in_progress",
                    RecordStatus::Completed => "completed",
                };
                metrics::IDEMPOTENCY_PURGED_TOTAL.with_label_values(&[status]).inc();
                batch.delete(CF_IDEMPOTENCY, record_key);
            }
        }

        let purged = batch.len();
        self.storage.write(batch)?;
        if purged > 0 {
            tracing::info!(purged, "Expired idempotency records purged");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::TenantId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Created {
        id: u32,
    }

    #[derive(Debug)]
    enum AppError {
        Guard(Error),
        Handler(&'static str),
    }

    impl From<Error> for AppError {
        fn from(e: Error) -> Self {
            AppError::Guard(e)
        }
    }

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(Storage::in_memory(), IdempotencyConfig::default())
    }

    #[tokio::test]
    async fn test_replay_returns_identical_bytes() {
        let guard = guard();
        let scope = Scope::new(TenantId::new(), "documents.create");
        let key = IdempotencyKey::new("req-1").unwrap();
        let calls = AtomicUsize::new(0);

        let first = guard
            .execute::<_, AppError, _, _>(&scope, &key, "fp", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Created { id: 7 })
            })
            .await
            .unwrap();
        let second = guard
            .execute::<Created, AppError, _, _>(&scope, &key, "fp", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Created { id: 8 })
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.value, Created { id: 7 });
        assert_eq!(first.snapshot, second.snapshot);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_conflicts() {
        let guard = guard();
        let scope = Scope::new(TenantId::new(), "documents.create");
        let key = IdempotencyKey::new("req-2").unwrap();

        guard
            .execute::<_, AppError, _, _>(&scope, &key, "fp-a", || async { Ok(Created { id: 1 }) })
            .await
            .unwrap();
        let result = guard
            .execute::<Created, AppError, _, _>(&scope, &key, "fp-b", || async { Ok(Created { id: 2 }) })
            .await;

        assert!(matches!(
            result,
            Err(AppError::Guard(Error::IdempotencyConflict { .. }))
        ));
    }

    #[tokio::test]
    async fn test_handler_failure_releases_claim() {
        let guard = guard();
        let scope = Scope::new(TenantId::new(), "documents.create");
        let key = IdempotencyKey::new("req-3").unwrap();

        let failed = guard
            .execute::<Created, AppError, _, _>(&scope, &key, "fp", || async {
                Err(AppError::Handler("provider down"))
            })
            .await;
        assert!(matches!(failed, Err(AppError::Handler(_))));
        assert!(guard.get(&scope, &key).unwrap().is_none());

        let retried = guard
            .execute::<_, AppError, _, _>(&scope, &key, "fp", || async { Ok(Created { id: 3 }) })
            .await
            .unwrap();
        assert!(!retried.replayed);
    }

    #[tokio::test]
    async fn test_in_progress_fails_fast() {
        let guard = guard();
        let scope = Scope::new(TenantId::new(), "documents.create");
        let key = IdempotencyKey::new("req-4").unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let guard = guard.clone();
            let scope = scope.clone();
            let key = key.clone();
            tokio::spawn(async move {
                guard
                    .execute::<_, AppError, _, _>(&scope, &key, "fp", || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(Created { id: 4 })
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        let concurrent = guard
            .execute::<Created, AppError, _, _>(&scope, &key, "fp", || async { Ok(Created { id: 5 }) })
            .await;
        assert!(matches!(
            concurrent,
            Err(AppError::Guard(Error::ConflictInProgress { .. }))
        ));

        release_tx.send(()).unwrap();
        let done = slow.await.unwrap().unwrap();
        assert_eq!(done.value, Created { id: 4 });
    }

    #[tokio::test]
    async fn test_abandoned_request_releases_claim() {
        let guard = guard();
        let scope = Scope::new(TenantId::new(), "documents.create");
        let key = IdempotencyKey::new("req-dropped").unwrap();

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            guard.execute::<Created, AppError, _, _>(&scope, &key, "fp", || async {
                std::future::pending::<()>().await;
                Ok(Created { id: 0 })
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(guard.get(&scope, &key).unwrap().is_none());

        let retried = guard
            .execute::<_, AppError, _, _>(&scope, &key, "fp", || async { Ok(Created { id: 6 }) })
            .await
            .unwrap();
        assert!(!retried.replayed);
        assert_eq!(retried.value, Created { id: 6 });
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let guard = guard();
        let key = IdempotencyKey::new("shared").unwrap();

        for tenant in [TenantId::new(), TenantId::new()] {
            let executed = guard
                .execute::<_, AppError, _, _>(&Scope::new(tenant, "documents.create"), &key, "fp", || async {
                    Ok(Created { id: 9 })
                })
                .await
                .unwrap();
            assert!(!executed.replayed);
        }
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let guard = guard();
        let scope = Scope::new(TenantId::new(), "documents.create");
        let key = IdempotencyKey::new("old").unwrap();

        guard
            .execute::<_, AppError, _, _>(&scope, &key, "fp", || async { Ok(Created { id: 1 }) })
            .await
            .unwrap();

        assert_eq!(guard.purge_expired(Utc::now()).unwrap(), 0);
        let purged = guard
            .purge_expired(Utc::now() + chrono::Duration::hours(25))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(guard.get(&scope, &key).unwrap().is_none());
    }
}
