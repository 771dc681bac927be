//! Ledger-wide properties checked through the public API, including under
//! injected storage failures and concurrent callers.

mod common;

use bank_ledger::{
    AccountClass, AccountId, AdjustmentIntent, Amendment, Channel, Direction, HistoryQuery,
    IdempotencyKey, InMemoryAccountStore, Ledger, LedgerConfig, LedgerError, Money, OwnerId,
    RecordingSink, TransferOrchestrator, TransferOutcome, TxKind, TxStatus,
};
use common::{BalanceWitnessLog, FlakyAccountStore, FlakyTransactionLog};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn quick_config() -> LedgerConfig {
    LedgerConfig {
        retry_backoff: Duration::from_millis(1),
        ..LedgerConfig::default()
    }
}

fn flaky_ledger() -> (Arc<Ledger>, Arc<FlakyAccountStore>, Arc<FlakyTransactionLog>) {
    let store = Arc::new(FlakyAccountStore::new());
    let log = Arc::new(FlakyTransactionLog::new());
    let ledger = Ledger::new(store.clone(), log.clone()).with_config(quick_config());
    (Arc::new(ledger), store, log)
}

fn open(ledger: &Ledger, owner: &str, opening_minor: i64) -> AccountId {
    ledger
        .open_account(OwnerId::from(owner), AccountClass::Current, opening_minor, None)
        .unwrap()
        .id()
}

fn balance(ledger: &Ledger, id: AccountId) -> Money {
    ledger.get_account(id).unwrap().balance()
}

fn assert_reconciles(ledger: &Ledger, id: AccountId) {
    let (recorded, reconstructed) = ledger.reconcile(id).unwrap();
    assert_eq!(recorded, reconstructed, "balance disagrees with history");
}

// ==================== BALANCE RECONSTRUCTION ====================

#[test]
fn test_balance_matches_history_after_mixed_operations() {
    let ledger = Arc::new(Ledger::in_memory());
    let transfers = TransferOrchestrator::new(ledger.clone());
    let a = open(&ledger, "alice", 10_000);
    let b = open(&ledger, "bob", 0);

    ledger.apply_deposit(a, 2_550, "Salary", Channel::Online, None).unwrap();
    ledger.apply_withdrawal(a, 1_000, "ATM", Channel::Atm, None).unwrap();
    transfers.execute(a, b, 4_000, "Rent", None).unwrap();
    ledger.apply_fee(b, 150, "Monthly fee").unwrap();
    ledger.post_interest(a, 12, "Interest").unwrap();
    ledger
        .apply_admin_adjustment(b, AdjustmentIntent::Credit, 500, "", None)
        .unwrap();
    // rejected operations leave no trace
    assert!(ledger.apply_withdrawal(b, 1_000_000, "", Channel::Atm, None).is_err());

    assert_eq!(balance(&ledger, a), Money::from_minor(7_562));
    assert_eq!(balance(&ledger, b), Money::from_minor(4_350));
    assert_reconciles(&ledger, a);
    assert_reconciles(&ledger, b);
}

#[test]
fn test_every_completed_record_has_consistent_snapshots() {
    let ledger = Arc::new(Ledger::in_memory());
    let transfers = TransferOrchestrator::new(ledger.clone());
    let a = open(&ledger, "alice", 5_000);
    let b = open(&ledger, "bob", 5_000);

    for i in 1..=10 {
        transfers.execute(a, b, i * 10, "", None).unwrap();
        transfers.execute(b, a, i * 5, "", None).unwrap();
    }

    for id in [a, b] {
        let records = ledger.journal().all_for_account(id).unwrap();
        assert_eq!(records.len(), 20);
        let mut running = ledger.get_account(id).unwrap().opening_balance();
        for record in records {
            assert!(record.amount.is_positive());
            assert_eq!(record.status, TxStatus::Completed);
            assert_eq!(record.balance_before, running);
            assert_eq!(
                record.balance_after,
                record.direction.apply(record.balance_before, record.amount)
            );
            running = record.balance_after;
        }
        assert_eq!(running, balance(&ledger, id));
    }
}

#[test]
fn test_balance_never_goes_negative() {
    let ledger = Ledger::in_memory();
    let a = open(&ledger, "alice", 1_000);

    assert!(matches!(
        ledger.apply_withdrawal(a, 1_001, "", Channel::Atm, None),
        Err(LedgerError::InsufficientFunds { .. })
    ));
    assert!(matches!(
        ledger.apply_fee(a, 1_001, ""),
        Err(LedgerError::InsufficientFunds { .. })
    ));
    assert!(matches!(
        ledger.apply_admin_adjustment(a, AdjustmentIntent::Debit, 1_001, "", None),
        Err(LedgerError::InsufficientFunds { .. })
    ));

    ledger.apply_withdrawal(a, 1_000, "", Channel::Atm, None).unwrap();
    assert!(balance(&ledger, a).is_zero());
    assert_eq!(ledger.journal().all_for_account(a).unwrap().len(), 1);
}

// ==================== ATOMICITY ====================

#[test]
fn test_append_failure_restores_balance() {
    let (ledger, _store, log) = flaky_ledger();
    let a = open(&ledger, "alice", 10_000);

    log.set_down(true);
    let result = ledger.apply_deposit(a, 5_000, "", Channel::Online, None);
    assert!(matches!(result, Err(LedgerError::StorageTimeout(_))));
    assert_eq!(balance(&ledger, a), Money::from_minor(10_000));
    assert!(ledger.journal().is_empty());

    log.set_down(false);
    ledger.apply_deposit(a, 5_000, "", Channel::Online, None).unwrap();
    assert_eq!(balance(&ledger, a), Money::from_minor(15_000));
    assert_reconciles(&ledger, a);
}

#[test]
fn test_completion_failure_restores_balance_and_fails_record() {
    let (ledger, _store, log) = flaky_ledger();
    let a = open(&ledger, "alice", 10_000);

    log.set_completion_down(true);
    let result = ledger.apply_deposit(a, 5_000, "", Channel::Online, None);
    assert!(matches!(result, Err(LedgerError::StorageTimeout(_))));
    assert_eq!(balance(&ledger, a), Money::from_minor(10_000));

    // one staged record, left failed and moving nothing
    let records = ledger.journal().all_for_account(a).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TxStatus::Failed);
    assert_eq!(records[0].balance_before, Money::from_minor(10_000));
    assert_eq!(records[0].balance_after, Money::from_minor(10_000));
    assert_reconciles(&ledger, a);

    log.set_completion_down(false);
    ledger.apply_deposit(a, 5_000, "", Channel::Online, None).unwrap();
    assert_eq!(balance(&ledger, a), Money::from_minor(15_000));
    assert_reconciles(&ledger, a);
}

#[test]
fn test_record_exists_before_balance_is_written() {
    let store = Arc::new(InMemoryAccountStore::new());
    let log = Arc::new(BalanceWitnessLog::new(store.clone()));
    let ledger = Ledger::new(store, log.clone());
    let a = open(&ledger, "alice", 10_000);

    ledger.apply_deposit(a, 2_500, "", Channel::Online, None).unwrap();
    ledger.apply_withdrawal(a, 500, "", Channel::Atm, None).unwrap();

    // at append time the store still holds the old balance...
    assert_eq!(
        log.at_append(),
        vec![
            (Money::from_minor(10_000), Money::from_minor(10_000)),
            (Money::from_minor(12_500), Money::from_minor(12_500)),
        ]
    );
    // ...and the new balance is in place when the record completes
    assert_eq!(
        log.at_completion(),
        vec![
            (Money::from_minor(12_500), Money::from_minor(12_500)),
            (Money::from_minor(12_000), Money::from_minor(12_000)),
        ]
    );
}

#[test]
fn test_persist_failure_leaves_failed_record() {
    let (ledger, store, _log) = flaky_ledger();
    let a = open(&ledger, "alice", 10_000);

    store.set_down(true);
    assert!(matches!(
        ledger.apply_withdrawal(a, 1_000, "", Channel::Atm, None),
        Err(LedgerError::StorageTimeout(_))
    ));
    store.set_down(false);

    assert_eq!(balance(&ledger, a), Money::from_minor(10_000));
    let records = ledger.journal().all_for_account(a).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TxStatus::Failed);
    assert_eq!(records[0].net_effect(), Money::ZERO);
    assert_reconciles(&ledger, a);
}

#[test]
fn test_conflict_is_retried() {
    let (ledger, store, _log) = flaky_ledger();
    let a = open(&ledger, "alice", 0);

    store.conflict_next(2);
    ledger.apply_deposit(a, 100, "", Channel::Online, None).unwrap();
    assert_eq!(balance(&ledger, a), Money::from_minor(100));
    // retries reuse the one staged record
    let records = ledger.journal().all_for_account(a).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TxStatus::Completed);
}

#[test]
fn test_retries_are_bounded() {
    let (ledger, store, _log) = flaky_ledger();
    let a = open(&ledger, "alice", 0);

    store.conflict_next(ledger.config().max_retries as usize + 1);
    assert!(matches!(
        ledger.apply_deposit(a, 100, "", Channel::Online, None),
        Err(LedgerError::Conflict(_))
    ));
    assert!(balance(&ledger, a).is_zero());
}

// ==================== CONCURRENCY ====================

#[test]
fn test_concurrent_deposits_are_serialized() {
    let ledger = Arc::new(Ledger::in_memory());
    let a = open(&ledger, "alice", 0);

    thread::scope(|s| {
        for _ in 0..100 {
            s.spawn(|| {
                ledger.apply_deposit(a, 100, "", Channel::Online, None).unwrap();
            });
        }
    });

    assert_eq!(balance(&ledger, a), Money::from_minor(10_000));
    assert_eq!(ledger.journal().all_for_account(a).unwrap().len(), 100);
    assert_reconciles(&ledger, a);
}

#[test]
fn test_readers_never_see_unrecorded_balance() {
    let ledger = Arc::new(Ledger::in_memory());
    let a = open(&ledger, "alice", 0);

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..200 {
                ledger.apply_deposit(a, 10, "", Channel::Online, None).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..200 {
                let (recorded, reconstructed) = ledger.reconcile(a).unwrap();
                assert_eq!(recorded, reconstructed);
            }
        });
    });

    assert_eq!(balance(&ledger, a), Money::from_minor(2_000));
}

#[test]
fn test_shared_key_on_two_accounts_applies_once() {
    let ledger = Arc::new(Ledger::in_memory());
    let a = open(&ledger, "alice", 0);
    let b = open(&ledger, "bob", 0);

    for round in 0..50 {
        let key = IdempotencyKey(format!("shared-{round}"));
        let applied: usize = thread::scope(|s| {
            let handles: Vec<_> = [a, b]
                .into_iter()
                .map(|id| {
                    let key = key.clone();
                    let ledger = &ledger;
                    s.spawn(move || {
                        ledger
                            .apply_deposit(id, 100, "", Channel::Online, Some(key))
                            .is_ok() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(applied, 1, "round {round}");
    }

    assert_eq!(balance(&ledger, a) + balance(&ledger, b), Money::from_minor(5_000));
    assert_eq!(ledger.journal().len(), 50);
}

#[test]
fn test_failed_request_frees_its_key() {
    let ledger = Ledger::in_memory();
    let a = open(&ledger, "alice", 0);
    let key = || Some(IdempotencyKey::from("w-1"));

    assert!(matches!(
        ledger.apply_withdrawal(a, 100, "", Channel::Atm, key()),
        Err(LedgerError::InsufficientFunds { .. })
    ));
    ledger.apply_deposit(a, 500, "", Channel::Online, None).unwrap();
    ledger.apply_withdrawal(a, 100, "", Channel::Atm, key()).unwrap();
    assert_eq!(balance(&ledger, a), Money::from_minor(400));
}

#[test]
fn test_balance_cannot_leave_minor_unit_range() {
    let ledger = Ledger::in_memory();
    let a = open(&ledger, "alice", 0);

    ledger.apply_deposit(a, i64::MAX, "", Channel::Online, None).unwrap();
    assert!(matches!(
        ledger.apply_deposit(a, 1, "", Channel::Online, None),
        Err(LedgerError::InvalidInput(_))
    ));
    assert_eq!(balance(&ledger, a).to_minor(), Some(i64::MAX));
    assert_eq!(ledger.journal().len(), 1);
    let history = ledger.history(a, &HistoryQuery::default()).unwrap();
    assert_eq!(history[0].balance_after_minor, i64::MAX);
}

#[test]
fn test_opposite_transfers_do_not_deadlock() {
    let ledger = Arc::new(Ledger::in_memory());
    let transfers = TransferOrchestrator::new(ledger.clone());
    let a = open(&ledger, "alice", 50_000);
    let b = open(&ledger, "bob", 50_000);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    transfers.execute(a, b, 100, "", None).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..25 {
                    transfers.execute(b, a, 100, "", None).unwrap();
                }
            });
        }
    });

    assert_eq!(balance(&ledger, a), Money::from_minor(50_000));
    assert_eq!(balance(&ledger, b), Money::from_minor(50_000));
    assert_reconciles(&ledger, a);
    assert_reconciles(&ledger, b);
}

#[test]
fn test_concurrent_withdrawals_cannot_overdraw() {
    let ledger = Arc::new(Ledger::in_memory());
    let a = open(&ledger, "alice", 1_000);

    let successes: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..20)
            .map(|_| s.spawn(|| ledger.apply_withdrawal(a, 100, "", Channel::Atm, None).is_ok()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
    });

    assert_eq!(successes, 10);
    assert!(balance(&ledger, a).is_zero());
}

// ==================== TRANSFERS ====================

#[test]
fn test_transfer_moves_funds_and_links_records() {
    let ledger = Arc::new(Ledger::in_memory());
    let transfers = TransferOrchestrator::new(ledger.clone());
    let a = open(&ledger, "alice", 20_000);
    let b = open(&ledger, "bob", 0);

    let summary = transfers.execute(a, b, 5_000, "Dinner", None).unwrap();
    assert_eq!(summary.outcome, TransferOutcome::Completed);
    assert_eq!(balance(&ledger, a), Money::from_minor(15_000));
    assert_eq!(balance(&ledger, b), Money::from_minor(5_000));

    let linked = ledger
        .journal()
        .find_by_correlation(summary.correlation_id)
        .unwrap();
    assert_eq!(linked.len(), 2);
    let debit = linked.iter().find(|r| r.direction == Direction::Debit).unwrap();
    let credit = linked.iter().find(|r| r.direction == Direction::Credit).unwrap();
    assert_eq!(debit.account_id, a);
    assert_eq!(debit.counterparty_id, Some(b));
    assert_eq!(credit.account_id, b);
    assert_eq!(credit.counterparty_id, Some(a));
    assert_eq!(debit.amount, credit.amount);
}

#[test]
fn test_failed_credit_leg_is_compensated() {
    let (ledger, store, _log) = flaky_ledger();
    let sink = Arc::new(RecordingSink::new());
    let transfers = TransferOrchestrator::new(ledger.clone()).with_sink(sink.clone());
    let a = open(&ledger, "alice", 10_000);
    let b = open(&ledger, "bob", 0);

    store.fail_persist_for(b);
    let err = transfers.execute(a, b, 3_000, "", None).unwrap_err();

    let summary = match err {
        LedgerError::PartialTransferReversed { summary, .. } => summary,
        other => panic!("expected a reversed transfer, got {other}"),
    };
    assert_eq!(summary.outcome, TransferOutcome::Reversed);
    assert!(summary.failed_credit.is_some());
    assert_eq!(balance(&ledger, a), Money::from_minor(10_000));
    assert!(balance(&ledger, b).is_zero());

    let linked = ledger
        .journal()
        .find_by_correlation(summary.correlation_id)
        .unwrap();
    assert_eq!(linked.len(), 3);
    let reversal = linked.iter().find(|r| r.kind == TxKind::Reversal).unwrap();
    assert_eq!(reversal.account_id, a);
    assert_eq!(reversal.direction, Direction::Credit);
    assert_eq!(reversal.reverses, Some(summary.debit.id));
    assert!(linked
        .iter()
        .any(|r| r.account_id == b && r.status == TxStatus::Failed));

    assert_reconciles(&ledger, a);
    assert_eq!(sink.events().len(), 1);
}

#[test]
fn test_failed_reversal_requires_reconciliation() {
    let (ledger, store, _log) = flaky_ledger();
    let sink = Arc::new(RecordingSink::new());
    let transfers = TransferOrchestrator::new(ledger.clone()).with_sink(sink.clone());
    let a = open(&ledger, "alice", 10_000);
    let b = open(&ledger, "bob", 0);

    // the debit lands, then the store goes away before the reversal
    store.fail_persist_for(b);
    store.go_down_after(1);
    let err = transfers.execute(a, b, 1_000, "", None).unwrap_err();

    assert!(matches!(err, LedgerError::ReconciliationRequired { .. }));
    assert!(err.is_fatal());
    assert_eq!(balance(&ledger, a), Money::from_minor(9_000));
    assert!(balance(&ledger, b).is_zero());
    assert!(sink.events().is_empty());
}

// ==================== IDEMPOTENCE & IMMUTABILITY ====================

#[test]
fn test_idempotent_replay_across_operations() {
    let ledger = Arc::new(Ledger::in_memory());
    let transfers = TransferOrchestrator::new(ledger.clone());
    let a = open(&ledger, "alice", 10_000);
    let b = open(&ledger, "bob", 0);
    let key = || Some(IdempotencyKey::from("req-42"));

    let first = transfers.execute(a, b, 1_000, "", key()).unwrap();
    let again = transfers.execute(a, b, 1_000, "", key()).unwrap();
    assert_eq!(first, again);
    assert_eq!(balance(&ledger, b), Money::from_minor(1_000));

    // same key, different request
    assert!(matches!(
        transfers.execute(a, b, 2_000, "", key()),
        Err(LedgerError::InvalidInput(_))
    ));

    let dep = Some(IdempotencyKey::from("dep-1"));
    let d1 = ledger.apply_deposit(a, 500, "", Channel::Online, dep.clone()).unwrap();
    let d2 = ledger.apply_deposit(a, 500, "", Channel::Online, dep).unwrap();
    assert_eq!(d1.id, d2.id);
    assert_eq!(balance(&ledger, a), Money::from_minor(9_500));
}

#[test]
fn test_completed_records_are_immutable() {
    let ledger = Ledger::in_memory();
    let a = open(&ledger, "alice", 0);
    let summary = ledger.apply_deposit(a, 700, "", Channel::Online, None).unwrap();

    let amend = ledger.amend_record(
        summary.id,
        Amendment {
            amount: Some(Money::from_minor(70_000)),
            ..Amendment::default()
        },
    );
    assert!(matches!(amend, Err(LedgerError::ImmutableRecord(_))));
    assert!(matches!(
        ledger.update_record_status(summary.id, TxStatus::Failed),
        Err(LedgerError::ImmutableRecord(_))
    ));

    let stored = ledger.journal().get(summary.id).unwrap();
    assert_eq!(stored.amount, Money::from_minor(700));
    assert_eq!(stored.status, TxStatus::Completed);
}

// ==================== HISTORY ====================

#[test]
fn test_history_is_newest_first_and_filterable() {
    let ledger = Ledger::in_memory();
    let a = open(&ledger, "alice", 10_000);
    ledger.apply_deposit(a, 100, "first", Channel::Online, None).unwrap();
    ledger.apply_withdrawal(a, 200, "second", Channel::Atm, None).unwrap();
    ledger.apply_deposit(a, 300, "third", Channel::Online, None).unwrap();

    let all = ledger.history(a, &HistoryQuery::default()).unwrap();
    let descriptions: Vec<&str> = all.iter().map(|s| s.description.as_str()).collect();
    assert_eq!(descriptions, vec!["third", "second", "first"]);

    let deposits = ledger
        .history(
            a,
            &HistoryQuery {
                kind: Some(TxKind::Deposit),
                ..HistoryQuery::default()
            },
        )
        .unwrap();
    assert_eq!(deposits.len(), 2);

    let page = ledger
        .history(
            a,
            &HistoryQuery {
                limit: 1,
                offset: 1,
                ..HistoryQuery::default()
            },
        )
        .unwrap();
    assert_eq!(page[0].description, "second");
}
