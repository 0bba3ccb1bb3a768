//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Conservation: cached balance == Σ(credits) − Σ(debits)
//! - No overcommit: Σ(active holds) <= pool balance, for reservations and
//!   for direct pool debits
//! - Serialized writes: concurrent debits on one wallet never lose an update

use ledger_core::{
    Config, EntryKind, EntryReason, Error, Ledger, NoopSink, ReservationStatus, Storage, TenantId,
    WalletRef, WalletSettings,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

/// Strategy for generating valid amounts (positive decimals)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1u64..1_000_000u64).prop_map(|cents| Decimal::new(cents as i64, 2))
}

/// A wallet operation: true = credit, false = debit
fn op_strategy() -> impl Strategy<Value = (bool, Decimal)> {
    (any::<bool>(), amount_strategy())
}

fn create_test_ledger() -> Ledger {
    Ledger::with_storage(Config::default(), Storage::in_memory(), Arc::new(NoopSink)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any sequence of credits and debits leaves the cached balance
    /// equal to the sum of entries
    #[test]
    fn prop_balance_conservation(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger();
            let wallet = WalletRef::main(TenantId::new());
            let mut expected = Decimal::ZERO;

            for (is_credit, amount) in &ops {
                if *is_credit {
                    ledger.credit(wallet, *amount, EntryReason::PackageTopup, None).await.unwrap();
                    expected += *amount;
                } else {
                    ledger.debit_for_document(wallet, *amount, EntryReason::InvoiceSent, "doc").await.unwrap();
                    expected -= *amount;
                }
            }

            let verification = ledger.verify_wallet(wallet).unwrap();
            prop_assert!(verification.is_consistent());
            prop_assert_eq!(verification.cached_balance, expected);
            prop_assert_eq!(verification.entry_count, ops.len());

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: with auto top-up enabled every entry still sums to the balance
    #[test]
    fn prop_auto_topup_preserves_conservation(
        debits in prop::collection::vec(1u32..50u32, 1..30),
        threshold in 1u32..100u32,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger();
            let wallet = WalletRef::main(TenantId::new());
            ledger.configure_wallet(wallet, WalletSettings {
                low_balance_threshold: Decimal::from(threshold),
                auto_topup_enabled: true,
                auto_topup_amount: dec!(100),
                ..WalletSettings::default()
            }).await.unwrap();

            for amount in &debits {
                ledger.debit_for_document(wallet, Decimal::from(*amount), EntryReason::VoucherSent, "voucher")
                    .await
                    .unwrap();
            }

            let verification = ledger.verify_wallet(wallet).unwrap();
            prop_assert!(verification.is_consistent());
            prop_assert!(verification.entry_count >= debits.len());

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: outstanding holds never exceed the pool balance
    #[test]
    fn prop_pool_never_overcommitted(
        pool in 1u64..5_000u64,
        requests in prop::collection::vec(1u64..1_000u64, 1..30),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger();
            ledger.credit(ledger.pool_wallet(), Decimal::from(pool), EntryReason::ManualAdjustment, None)
                .await
                .unwrap();

            let mut granted = 0u64;
            for (i, credits) in requests.iter().enumerate() {
                match ledger.reserve_pool_credits(TenantId::new(), format!("pay-{}", i), *credits, None).await {
                    Ok(_) => granted += credits,
                    Err(Error::InsufficientPoolCredits { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }

            prop_assert!(granted <= pool);
            let availability = ledger.pool_availability().unwrap();
            prop_assert_eq!(availability.reserved, Decimal::from(granted));
            prop_assert!(availability.available >= Decimal::ZERO);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_serialize() {
        let ledger = create_test_ledger();
        let wallet = WalletRef::main(TenantId::new());
        ledger
            .credit(wallet, dec!(100), EntryReason::PackageTopup, None)
            .await
            .unwrap();

        let a = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .debit_for_document(wallet, dec!(50), EntryReason::InvoiceSent, "doc-a")
                    .await
            })
        };
        let b = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .debit_for_document(wallet, dec!(50), EntryReason::InvoiceSent, "doc-b")
                    .await
            })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        // Each debit observed the other's committed state, never a stale one
        let mut seen = vec![a.entry.balance_after, b.entry.balance_after];
        seen.sort();
        assert_eq!(seen, vec![dec!(0), dec!(50)]);

        let final_wallet = ledger.get_wallet(wallet).unwrap();
        assert_eq!(final_wallet.balance, Decimal::ZERO);

        let debits = ledger
            .storage()
            .wallet_entries(&wallet)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EntryKind::Debit)
            .count();
        assert_eq!(debits, 2);
        assert!(ledger.verify_wallet(wallet).unwrap().is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_cannot_overcommit_pool() {
        let ledger = create_test_ledger();
        ledger
            .credit(ledger.pool_wallet(), dec!(1000), EntryReason::ManualAdjustment, None)
            .await
            .unwrap();

        let attempts: Vec<_> = (0..2)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .reserve_pool_credits(TenantId::new(), format!("purchase-{}", i), 600, None)
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        let mut rejected = 0;
        for attempt in futures::future::join_all(attempts).await {
            match attempt.unwrap() {
                Ok(r) => {
                    assert_eq!(r.status, ReservationStatus::Reserved);
                    ok += 1;
                }
                Err(Error::InsufficientPoolCredits { requested, available }) => {
                    assert_eq!(requested, 600);
                    assert_eq!(available, dec!(400));
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!((ok, rejected), (1, 1));
        assert_eq!(ledger.pool_availability().unwrap().available, dec!(400));
    }

    #[tokio::test]
    async fn test_purchase_flow_conserves_credits() {
        let ledger = create_test_ledger();
        let pool = ledger.pool_wallet();
        let buyer = TenantId::new();
        ledger
            .credit(pool, dec!(500), EntryReason::ManualAdjustment, None)
            .await
            .unwrap();

        ledger.reserve_pool_credits(buyer, "pay-ok", 200, None).await.unwrap();
        ledger.reserve_pool_credits(buyer, "pay-fail", 100, None).await.unwrap();

        ledger.capture_reservation("pay-ok").await.unwrap();
        ledger.cancel_reservation("pay-fail").await.unwrap();

        let buyer_wallet = WalletRef::e_credit(buyer);
        assert_eq!(ledger.get_wallet(pool).unwrap().balance, dec!(300));
        assert_eq!(ledger.get_wallet(buyer_wallet).unwrap().balance, dec!(200));
        assert!(ledger.verify_wallet(pool).unwrap().is_consistent());
        assert!(ledger.verify_wallet(buyer_wallet).unwrap().is_consistent());

        let transfer = ledger
            .storage()
            .wallet_entries(&pool)
            .unwrap()
            .into_iter()
            .find(|e| e.reason == EntryReason::TransferToCustomer)
            .expect("pool transfer entry");
        assert_eq!(transfer.reference.as_deref(), Some("pay-ok"));
    }

    #[tokio::test]
    async fn test_pool_debits_cannot_uncover_holds() {
        let ledger = create_test_ledger();
        let pool = ledger.pool_wallet();
        let buyer = TenantId::new();
        ledger
            .credit(pool, dec!(1000), EntryReason::ManualAdjustment, None)
            .await
            .unwrap();
        ledger.reserve_pool_credits(buyer, "pay-a", 600, None).await.unwrap();

        let adjustment = ledger.manual_adjustment(pool, dec!(-500), Some("audit".into())).await;
        match adjustment {
            Err(Error::PoolBalanceBelowReservations { balance, amount, reserved }) => {
                assert_eq!(balance, dec!(1000));
                assert_eq!(amount, dec!(500));
                assert_eq!(reserved, dec!(600));
            }
            other => panic!("expected PoolBalanceBelowReservations, got {:?}", other),
        }

        // The uncommitted part of the pool is still spendable
        ledger.manual_adjustment(pool, dec!(-400), None).await.unwrap();
        let document_debit = ledger
            .debit_for_document(pool, dec!(1), EntryReason::InvoiceSent, "doc-x")
            .await;
        assert!(matches!(document_debit, Err(Error::PoolBalanceBelowReservations { .. })));

        let availability = ledger.pool_availability().unwrap();
        assert_eq!(availability.balance, dec!(600));
        assert_eq!(availability.available, Decimal::ZERO);

        ledger.capture_reservation("pay-a").await.unwrap();
        assert_eq!(ledger.get_wallet(pool).unwrap().balance, Decimal::ZERO);
        assert_eq!(ledger.get_wallet(WalletRef::e_credit(buyer)).unwrap().balance, dec!(600));
        assert!(ledger.verify_wallet(pool).unwrap().is_consistent());
    }

    #[cfg(feature = "rocksdb")]
    #[tokio::test]
    async fn test_rocksdb_backend_survives_reopen() {
        use ledger_core::config::StorageBackend;

        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.backend = StorageBackend::RocksDb;
        let wallet = WalletRef::main(TenantId::new());

        {
            let ledger = Ledger::open(config.clone(), Arc::new(NoopSink)).await.unwrap();
            ledger
                .credit(wallet, dec!(42), EntryReason::PackageTopup, None)
                .await
                .unwrap();
            ledger.shutdown().await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let reopened = Ledger::open(config, Arc::new(NoopSink)).await.unwrap();
        assert_eq!(reopened.get_wallet(wallet).unwrap().balance, dec!(42));
        assert!(reopened.verify_wallet(wallet).unwrap().is_consistent());
    }
}
