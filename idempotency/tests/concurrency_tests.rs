//! Concurrent duplicate submissions against one key

use idempotency::{fingerprint, Error, IdempotencyConfig, IdempotencyGuard, IdempotencyKey, Scope};
use ledger_core::{Storage, TenantId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct DocumentCreated {
    document_id: String,
    status: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_same_key_executes_once() {
    let guard = IdempotencyGuard::new(Storage::in_memory(), IdempotencyConfig::default());
    let scope = Scope::new(TenantId::new(), "documents.create");
    let key = IdempotencyKey::new("invoice-2024-0001").unwrap();
    let fp = fingerprint("POST", "/v1/documents", br#"{"kind":"invoice"}"#);
    let executions = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let guard = guard.clone();
            let scope = scope.clone();
            let key = key.clone();
            let fp = fp.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                guard
                    .execute::<_, Error, _, _>(&scope, &key, &fp, || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(DocumentCreated {
                            document_id: uuid::Uuid::now_v7().to_string(),
                            status: "queued".to_string(),
                        })
                    })
                    .await
            })
        })
        .collect();

    let mut fresh = Vec::new();
    let mut in_progress = 0;
    for result in futures::future::join_all(tasks).await {
        match result.unwrap() {
            Ok(executed) => {
                assert!(!executed.replayed);
                fresh.push(executed);
            }
            Err(Error::ConflictInProgress { .. }) => in_progress += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(fresh.len(), 1);
    assert_eq!(in_progress, 15);

    // Once settled, every retry is a byte-identical replay
    for _ in 0..3 {
        let replay = guard
            .execute::<DocumentCreated, Error, _, _>(&scope, &key, &fp, || async {
                Err(Error::Config("handler must not run again".to_string()))
            })
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.snapshot, fresh[0].snapshot);
        assert_eq!(replay.value, fresh[0].value);
    }
}
