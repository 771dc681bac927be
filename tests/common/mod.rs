//! Failure-injecting stores shared by the integration tests.

#![allow(dead_code)]

use bank_ledger::{
    Account, AccountId, AccountStore, Amendment, CorrelationId, DateRange, Direction,
    InMemoryAccountStore, InMemoryTransactionLog, LedgerError, Money, OwnerId, Result,
    TransactionId, TransactionLog, TransactionRecord, TxKind, TxStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Account store whose `persist` can be made to fail.
#[derive(Default)]
pub struct FlakyAccountStore {
    inner: InMemoryAccountStore,
    /// Every persist of this account times out.
    failing: Mutex<Option<AccountId>>,
    /// The next `n` persists of any account report a conflict.
    conflicts: AtomicUsize,
    /// Every persist of any account times out.
    down: AtomicBool,
    /// Persists still allowed before the store goes down.
    budget: Mutex<Option<usize>>,
}

impl FlakyAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_persist_for(&self, account: AccountId) {
        *self.failing.lock() = Some(account);
    }

    pub fn conflict_next(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Lets `n` more persists through, then fails every one after.
    pub fn go_down_after(&self, n: usize) {
        *self.budget.lock() = Some(n);
    }
}

impl AccountStore for FlakyAccountStore {
    fn get_account(&self, id: AccountId) -> Result<Account> {
        self.inner.get_account(id)
    }

    fn get_account_by_number(&self, number: &str) -> Result<Account> {
        self.inner.get_account_by_number(number)
    }

    fn list_accounts(&self, owner: &OwnerId, include_closed: bool) -> Result<Vec<Account>> {
        self.inner.list_accounts(owner, include_closed)
    }

    fn insert(&self, account: Account) -> Result<Account> {
        self.inner.insert(account)
    }

    fn persist(&self, account: &Account) -> Result<Account> {
        if self.down.load(Ordering::SeqCst) || *self.failing.lock() == Some(account.id()) {
            return Err(LedgerError::StorageTimeout("persist".to_string()));
        }
        {
            let mut budget = self.budget.lock();
            match *budget {
                Some(0) => return Err(LedgerError::StorageTimeout("persist".to_string())),
                Some(n) => *budget = Some(n - 1),
                None => {}
            }
        }
        let pending = self.conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(LedgerError::Conflict(account.id().to_string()));
        }
        self.inner.persist(account)
    }

    fn all_accounts(&self) -> Result<Vec<Account>> {
        self.inner.all_accounts()
    }
}

/// Transaction log whose `append` or completion step can be switched off.
#[derive(Default)]
pub struct FlakyTransactionLog {
    inner: InMemoryTransactionLog,
    down: AtomicBool,
    /// Moving a record to `completed` times out.
    completion_down: AtomicBool,
}

impl FlakyTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_completion_down(&self, down: bool) {
        self.completion_down.store(down, Ordering::SeqCst);
    }
}

impl TransactionLog for FlakyTransactionLog {
    fn append(&self, record: TransactionRecord) -> Result<TransactionRecord> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LedgerError::StorageTimeout("append".to_string()));
        }
        self.inner.append(record)
    }

    fn get(&self, id: TransactionId) -> Result<TransactionRecord> {
        self.inner.get(id)
    }

    fn update_status(&self, id: TransactionId, status: TxStatus) -> Result<TransactionRecord> {
        if status == TxStatus::Completed && self.completion_down.load(Ordering::SeqCst) {
            return Err(LedgerError::StorageTimeout("update_status".to_string()));
        }
        self.inner.update_status(id, status)
    }

    fn amend(&self, id: TransactionId, amendment: Amendment) -> Result<TransactionRecord> {
        self.inner.amend(id, amendment)
    }

    fn find_filtered(
        &self,
        account: AccountId,
        kind: Option<TxKind>,
        limit: usize,
        offset: usize,
        range: Option<DateRange>,
    ) -> Result<Vec<TransactionRecord>> {
        self.inner.find_filtered(account, kind, limit, offset, range)
    }

    fn sum_by_kind_and_date_range(
        &self,
        account: AccountId,
        kind: TxKind,
        direction: Direction,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Money> {
        self.inner
            .sum_by_kind_and_date_range(account, kind, direction, start, end)
    }

    fn find_by_correlation(&self, correlation: CorrelationId) -> Result<Vec<TransactionRecord>> {
        self.inner.find_by_correlation(correlation)
    }

    fn all_for_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        self.inner.all_for_account(account)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Transaction log that notes the stored balance of the record's account
/// each time a record is appended or completed.
pub struct BalanceWitnessLog {
    inner: InMemoryTransactionLog,
    store: Arc<dyn AccountStore>,
    at_append: Mutex<Vec<(Money, Money)>>,
    at_completion: Mutex<Vec<(Money, Money)>>,
}

impl BalanceWitnessLog {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        BalanceWitnessLog {
            inner: InMemoryTransactionLog::new(),
            store,
            at_append: Mutex::new(Vec::new()),
            at_completion: Mutex::new(Vec::new()),
        }
    }

    /// `(stored balance, record balance_before)` for every append.
    pub fn at_append(&self) -> Vec<(Money, Money)> {
        self.at_append.lock().clone()
    }

    /// `(stored balance, record balance_after)` for every completion.
    pub fn at_completion(&self) -> Vec<(Money, Money)> {
        self.at_completion.lock().clone()
    }

    fn stored_balance(&self, account: AccountId) -> Money {
        self.store
            .get_account(account)
            .map(|a| a.balance())
            .unwrap_or_default()
    }
}

impl TransactionLog for BalanceWitnessLog {
    fn append(&self, record: TransactionRecord) -> Result<TransactionRecord> {
        let stored = self.stored_balance(record.account_id);
        self.at_append.lock().push((stored, record.balance_before));
        self.inner.append(record)
    }

    fn get(&self, id: TransactionId) -> Result<TransactionRecord> {
        self.inner.get(id)
    }

    fn update_status(&self, id: TransactionId, status: TxStatus) -> Result<TransactionRecord> {
        let record = self.inner.update_status(id, status)?;
        if status == TxStatus::Completed {
            let stored = self.stored_balance(record.account_id);
            self.at_completion.lock().push((stored, record.balance_after));
        }
        Ok(record)
    }

    fn amend(&self, id: TransactionId, amendment: Amendment) -> Result<TransactionRecord> {
        self.inner.amend(id, amendment)
    }

    fn find_filtered(
        &self,
        account: AccountId,
        kind: Option<TxKind>,
        limit: usize,
        offset: usize,
        range: Option<DateRange>,
    ) -> Result<Vec<TransactionRecord>> {
        self.inner.find_filtered(account, kind, limit, offset, range)
    }

    fn sum_by_kind_and_date_range(
        &self,
        account: AccountId,
        kind: TxKind,
        direction: Direction,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Money> {
        self.inner
            .sum_by_kind_and_date_range(account, kind, direction, start, end)
    }

    fn find_by_correlation(&self, correlation: CorrelationId) -> Result<Vec<TransactionRecord>> {
        self.inner.find_by_correlation(correlation)
    }

    fn all_for_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        self.inner.all_for_account(account)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
