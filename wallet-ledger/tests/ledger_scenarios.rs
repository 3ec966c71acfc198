//! End-to-end ledger scenarios
//!
//! Exercises the public `Ledger` API across execution contexts: funds
//! checks, transfers, atomic blocks, deferred visibility, events and
//! checksums.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;
use wallet_ledger::config::LockDriver;
use wallet_ledger::store::WalletUpdate;
use wallet_ledger::{
    BatchOperation, Config, Error, EventKind, Holder, Ledger, LedgerEvent, NewWallet, Outcome,
    Wallet,
};

fn checked_config() -> Config {
    let mut config = Config::default();
    config.checksum.enabled = true;
    config.checksum.secret = "test-secret".to_string();
    config
}

fn ledger() -> Ledger {
    Ledger::new(checked_config()).unwrap()
}

fn wallet(ledger: &Ledger, id: &str) -> Wallet {
    ledger
        .create_wallet(NewWallet::new(Holder::new("user", id)))
        .unwrap()
}

fn recording_ledger() -> (Ledger, Arc<Mutex<Vec<EventKind>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let ledger = Ledger::builder()
        .config(checked_config())
        .listener(Arc::new(move |event: &LedgerEvent| {
            sink.lock().push(event.kind());
        }))
        .build()
        .unwrap();
    (ledger, seen)
}

#[test]
fn deposit_withdraw_and_insufficient_funds() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");

    ledger.deposit(&w, "1000", None).unwrap();
    ledger.withdraw(&w, "500", None).unwrap();
    assert_eq!(ledger.balance(&w).unwrap(), "500");

    let err = ledger.withdraw(&w, "600", None).unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));
    assert_eq!(ledger.balance(&w).unwrap(), "500");
    assert_eq!(ledger.transaction_count(&w).unwrap(), 2);
}

#[test]
fn transfer_charges_fee_on_deposit_leg() {
    let ledger = ledger();
    let a = wallet(&ledger, "a");
    let b = wallet(&ledger, "b");
    ledger.deposit(&a, "1000", None).unwrap();

    let transfer = ledger.transfer(&a, &b, "300", "50", None).unwrap();

    assert_eq!(ledger.balance(&a).unwrap(), "700");
    assert_eq!(ledger.balance(&b).unwrap(), "250");
    assert_eq!(transfer.amount, "300");
    assert_eq!(transfer.fee, "50");

    assert_ne!(transfer.withdraw_id, transfer.deposit_id);
    assert_eq!(ledger.transaction_count(&a).unwrap(), 2);
    assert_eq!(ledger.transaction_count(&b).unwrap(), 1);
    ledger.verify_transfer(&transfer.uuid).unwrap();
}

#[test]
fn withdraw_from_empty_wallet() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");

    assert!(matches!(
        ledger.withdraw(&w, "100", None),
        Err(Error::BalanceIsEmpty { .. })
    ));
}

#[test]
fn error_inside_block_releases_lock_and_keeps_balance() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");
    ledger.deposit(&w, "1000", None).unwrap();

    let result: wallet_ledger::Result<()> = ledger.block(&w, || {
        ledger.deposit(&w, "100", None)?;
        assert!(ledger.is_blocked(&w));
        assert_eq!(ledger.balance(&w)?, "1100");
        Err(Error::InvalidAmount("abort".to_string()))
    });

    assert!(matches!(result, Err(Error::InvalidAmount(_))));
    assert!(!ledger.is_blocked(&w));
    assert_eq!(ledger.balance(&w).unwrap(), "1000");

    // another context can take the lock right away
    let other = ledger.clone();
    let target = w.clone();
    thread::spawn(move || other.deposit(&target, "1", None))
        .join()
        .unwrap()
        .unwrap();
    assert_eq!(ledger.balance(&w).unwrap(), "1001");
}

#[test]
fn invalid_amounts_are_rejected() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");

    for amount in ["0", "-5", "1.5", "abc", ""] {
        assert!(
            matches!(ledger.deposit(&w, amount, None), Err(Error::InvalidAmount(_))),
            "amount {:?} accepted",
            amount
        );
    }

    let other = wallet(&ledger, "2");
    ledger.deposit(&w, "100", None).unwrap();
    assert!(matches!(
        ledger.transfer(&w, &other, "50", "50", None),
        Err(Error::InvalidAmount(_))
    ));
    assert_eq!(ledger.balance(&w).unwrap(), "100");
}

#[test]
fn force_withdraw_may_go_negative() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");

    ledger.force_withdraw(&w, "50", None).unwrap();
    assert_eq!(ledger.balance(&w).unwrap(), "-50");
    assert_eq!(ledger.available_balance(&w).unwrap(), "0");
    ledger.verify_wallet(&w).unwrap();
}

#[test]
fn deferred_visibility_across_contexts() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");
    let deposited = Arc::new(Barrier::new(2));
    let observed = Arc::new(Barrier::new(2));

    let writer = {
        let ledger = ledger.clone();
        let w = w.clone();
        let deposited = deposited.clone();
        let observed = observed.clone();
        thread::spawn(move || {
            ledger
                .transaction(|| {
                    ledger.deposit(&w, "100", None)?;
                    // read-your-writes inside the open transaction
                    assert_eq!(ledger.balance(&w)?, "100");
                    deposited.wait();
                    observed.wait();
                    Ok(())
                })
                .unwrap();
        })
    };

    deposited.wait();
    assert_eq!(ledger.balance(&w).unwrap(), "0");
    observed.wait();
    writer.join().unwrap();

    assert_eq!(ledger.balance(&w).unwrap(), "100");
}

#[test]
fn opposite_transfers_never_interleave() {
    let ledger = ledger();
    let a = wallet(&ledger, "a");
    let b = wallet(&ledger, "b");
    ledger.deposit(&a, "10000", None).unwrap();
    ledger.deposit(&b, "10000", None).unwrap();

    let spawn = |from: Wallet, to: Wallet, amount: &'static str| {
        let ledger = ledger.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                ledger.transfer(&from, &to, amount, "0", None).unwrap();
            }
        })
    };
    let forward = spawn(a.clone(), b.clone(), "10");
    let backward = spawn(b.clone(), a.clone(), "7");
    forward.join().unwrap();
    backward.join().unwrap();

    assert_eq!(ledger.balance(&a).unwrap(), "9850");
    assert_eq!(ledger.balance(&b).unwrap(), "10150");
    assert_eq!(ledger.transaction_count(&a).unwrap(), 101);
    ledger.verify_wallet(&a).unwrap();
    ledger.verify_wallet(&b).unwrap();
}

#[test]
fn concurrent_deposits_sum_up() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            let w = w.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    ledger.deposit(&w, "3", None).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(ledger.balance(&w).unwrap(), "600");
    assert_eq!(ledger.transaction_count(&w).unwrap(), 200);
}

#[test]
fn lock_timeout_fails_transaction() {
    let mut config = checked_config();
    config.lock.timeout_seconds = 1;
    let ledger = Ledger::new(config).unwrap();
    let w = wallet(&ledger, "1");
    let locked = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));

    let holder = {
        let ledger = ledger.clone();
        let w = w.clone();
        let locked = locked.clone();
        let done = done.clone();
        thread::spawn(move || {
            ledger
                .block(&w, || {
                    locked.wait();
                    done.wait();
                    Ok(())
                })
                .unwrap();
        })
    };

    locked.wait();
    assert!(matches!(
        ledger.deposit(&w, "1", None),
        Err(Error::TransactionFailed(_))
    ));
    done.wait();
    holder.join().unwrap();

    ledger.deposit(&w, "1", None).unwrap();
    assert_eq!(ledger.metrics().lock_timeouts_total.get(), 1);
}

#[test]
fn cache_lock_driver_behaves_like_memory() {
    let mut config = checked_config();
    config.lock.driver = LockDriver::Cache;
    let ledger = Ledger::new(config).unwrap();
    let a = wallet(&ledger, "a");
    let b = wallet(&ledger, "b");

    ledger.deposit(&a, "1000", None).unwrap();
    ledger.transfer(&a, &b, "300", "50", None).unwrap();
    assert_eq!(ledger.balance(&a).unwrap(), "700");
    assert_eq!(ledger.balance(&b).unwrap(), "250");
    assert!(!ledger.is_blocked(&a));
}

#[test]
fn events_are_grouped_by_kind_after_commit() {
    let (ledger, seen) = recording_ledger();
    let a = wallet(&ledger, "a");
    let b = wallet(&ledger, "b");
    seen.lock().clear();

    ledger
        .transaction(|| {
            ledger.deposit(&a, "100", None)?;
            ledger.transfer(&a, &b, "40", "0", None)?;
            ledger.create_wallet(NewWallet::new(Holder::new("user", "c")))?;
            assert!(seen.lock().is_empty());
            Ok(())
        })
        .unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            EventKind::TransactionCreated,
            EventKind::TransactionCreated,
            EventKind::TransactionCreated,
            EventKind::TransferCreated,
            EventKind::WalletCreated,
        ]
    );
}

#[test]
fn rolled_back_work_leaves_nothing_behind() {
    let (ledger, seen) = recording_ledger();
    let w = wallet(&ledger, "1");
    seen.lock().clear();

    let value = ledger
        .transaction_with(|| {
            ledger.deposit(&w, "500", None)?;
            Ok(Outcome::Rollback(7))
        })
        .unwrap();

    assert_eq!(value, 7);
    assert!(seen.lock().is_empty());
    assert_eq!(ledger.balance(&w).unwrap(), "0");
    assert_eq!(ledger.transaction_count(&w).unwrap(), 0);
    assert!(!ledger.is_blocked(&w));
}

#[test]
fn nested_rollback_fails_outer_transaction() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");

    let result = ledger.transaction(|| {
        ledger.deposit(&w, "100", None)?;
        ledger.transaction_with(|| Ok(Outcome::Rollback(())))?;
        Ok(())
    });

    assert!(matches!(result, Err(Error::TransactionFailed(_))));
    assert_eq!(ledger.balance(&w).unwrap(), "0");
}

#[test]
fn freeze_limits_available_balance() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");
    ledger.deposit(&w, "1000", None).unwrap();

    assert_eq!(ledger.freeze(&w, Some("300")).unwrap(), "300");
    assert_eq!(ledger.available_balance(&w).unwrap(), "700");
    assert!(matches!(
        ledger.withdraw(&w, "800", None),
        Err(Error::InsufficientFunds { .. })
    ));

    assert_eq!(ledger.unfreeze(&w, Some("500")).unwrap(), "0");
    assert_eq!(ledger.freeze(&w, None).unwrap(), "1000");
    assert_eq!(ledger.available_balance(&w).unwrap(), "0");
    assert_eq!(ledger.unfreeze(&w, None).unwrap(), "0");
    assert_eq!(ledger.balance(&w).unwrap(), "1000");
    ledger.verify_wallet(&w).unwrap();
}

#[test]
fn batch_checks_net_effect_per_wallet() {
    let ledger = ledger();
    let a = wallet(&ledger, "a");
    let b = wallet(&ledger, "b");

    let created = ledger
        .apply(vec![
            BatchOperation::deposit(&a, "500"),
            BatchOperation::withdraw(&a, "300"),
            BatchOperation::deposit(&b, "20"),
        ])
        .unwrap();
    assert_eq!(created.len(), 3);
    assert_eq!(ledger.balance(&a).unwrap(), "200");
    assert_eq!(ledger.transaction_count(&a).unwrap(), 2);

    let err = ledger
        .apply(vec![
            BatchOperation::withdraw(&a, "300"),
            BatchOperation::deposit(&b, "10"),
        ])
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));
    assert_eq!(ledger.balance(&b).unwrap(), "20");
}

#[test]
fn float_transfer_uses_lower_precision() {
    let ledger = ledger();
    let cents = wallet(&ledger, "cents");
    let micros = ledger
        .create_wallet(
            NewWallet::new(Holder::new("user", "micros"))
                .slug("micros")
                .decimal_places(4),
        )
        .unwrap();
    ledger.deposit_float(&cents, "10", None).unwrap();

    let transfer = ledger
        .transfer_float(&cents, &micros, "1.5", "0.5", None)
        .unwrap();

    assert_eq!(transfer.decimal_places, 2);
    assert_eq!(ledger.balance(&cents).unwrap(), "850");
    assert_eq!(ledger.balance(&micros).unwrap(), "10000");
    assert_eq!(ledger.balance_float(&micros).unwrap(), "1");
}

#[test]
fn tampered_wallet_is_detected() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");
    ledger.deposit(&w, "100", None).unwrap();
    ledger.verify_wallet(&w).unwrap();

    let row = ledger.find_wallet_by_uuid(&w.uuid).unwrap().unwrap();
    let updates = BTreeMap::from([(
        row.id,
        WalletUpdate {
            balance: "1000000".to_string(),
            frozen_amount: row.frozen_amount.clone(),
            checksum: row.checksum.clone(),
        },
    )]);
    ledger.store().batch_update_wallets(&updates).unwrap();
    ledger.bookkeeper().forget(&w.uuid);

    assert!(matches!(
        ledger.verify_wallet(&w),
        Err(Error::WalletInconsistency(_))
    ));
    assert!(matches!(
        ledger.balance(&w),
        Err(Error::WalletInconsistency(_))
    ));
    assert!(ledger.metrics().checksum_failures_total.get() >= 2);
}

#[test]
fn transaction_checksums_verify() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");
    let tx = ledger
        .deposit(&w, "42", Some(serde_json::json!({"source": "card"})))
        .unwrap();

    ledger.verify_transaction(&tx.uuid).unwrap();
    assert!(matches!(
        ledger.verify_transaction(&uuid::Uuid::now_v7()),
        Err(Error::RecordNotFound(_))
    ));
}

fn deposit_twice_with_cache_miss(ledger: &Ledger) -> wallet_ledger::Result<Wallet> {
    let w = wallet(ledger, "1");
    ledger.transaction(|| {
        ledger.deposit(&w, "100", None)?;
        // committed balance evicted while the transaction still holds rows
        ledger.bookkeeper().forget(&w.uuid);
        ledger.deposit(&w, "100", None)?;
        assert_eq!(ledger.balance(&w)?, "200");
        assert_eq!(ledger.transaction_count(&w)?, 2);
        Ok(())
    })?;
    Ok(w)
}

#[test]
fn cache_miss_inside_transaction_keeps_checksums_valid() {
    let ledger = ledger();
    let w = deposit_twice_with_cache_miss(&ledger).unwrap();

    assert_eq!(ledger.balance(&w).unwrap(), "200");
    assert_eq!(ledger.transaction_count(&w).unwrap(), 2);
    ledger.verify_wallet(&w).unwrap();
}

#[test]
fn cache_miss_inside_transaction_does_not_double_count() {
    let ledger = Ledger::in_memory().unwrap();
    let w = deposit_twice_with_cache_miss(&ledger).unwrap();

    assert_eq!(ledger.transaction_count(&w).unwrap(), 2);
    ledger.bookkeeper().forget(&w.uuid);
    assert_eq!(ledger.transaction_count(&w).unwrap(), 2);
}

#[test]
fn reads_from_other_contexts_never_cache_open_rows() {
    let ledger = ledger();
    let w = wallet(&ledger, "1");
    let deposited = Arc::new(Barrier::new(2));
    let read = Arc::new(Barrier::new(2));

    let writer = {
        let ledger = ledger.clone();
        let w = w.clone();
        let deposited = deposited.clone();
        let read = read.clone();
        thread::spawn(move || {
            ledger
                .transaction_with(|| {
                    ledger.deposit(&w, "100", None)?;
                    ledger.bookkeeper().forget(&w.uuid);
                    // balance read of this context with the cache empty
                    assert_eq!(ledger.balance(&w)?, "100");
                    deposited.wait();
                    read.wait();
                    Ok(Outcome::Rollback(()))
                })
                .unwrap();
        })
    };

    deposited.wait();
    assert_eq!(ledger.transaction_count(&w).unwrap(), 0);
    read.wait();
    writer.join().unwrap();

    assert_eq!(ledger.balance(&w).unwrap(), "0");
    assert_eq!(ledger.transaction_count(&w).unwrap(), 0);
}

#[test]
fn wallet_created_and_funded_in_one_transaction() {
    let ledger = ledger();
    let w = ledger
        .transaction(|| {
            let w = ledger.create_wallet(NewWallet::new(Holder::new("user", "new")))?;
            ledger.deposit(&w, "75", None)?;
            ledger.deposit(&w, "25", None)?;
            Ok(w)
        })
        .unwrap();

    assert_eq!(ledger.balance(&w).unwrap(), "100");
    assert_eq!(ledger.transaction_count(&w).unwrap(), 2);
    ledger.verify_wallet(&w).unwrap();
}

#[test]
fn debug_output_hides_checksum_secret() {
    let builder = Ledger::builder().config(checked_config());
    assert!(!format!("{:?}", builder).contains("test-secret"));

    let ledger = builder.build().unwrap();
    let printed = format!("{:?}", ledger);
    assert!(!printed.contains("test-secret"));
    assert!(printed.contains("<redacted>"));
}
