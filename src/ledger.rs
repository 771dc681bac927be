//! Ledger engine: the single authority for balance mutation.
//!
//! Every mutation runs under the account's lock as one unit: load,
//! validate, append the record as pending, write the new balance, then mark
//! the record completed. Validation failures return before anything is
//! written. If the balance write fails the pending record ends up failed;
//! if completing the record fails, the previous balance is restored before
//! the lock is released. Reads take the same lock, so no reader sees a
//! balance whose record is not yet completed.

use crate::account::{generate_account_number, Account, AccountClass, AccountId, AccountOptions, AccountStatus, OwnerId};
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::idempotency::{Claim, IdempotencyCache, RequestFingerprint};
use crate::journal::{Amendment, DateRange, InMemoryTransactionLog, TransactionLog};
use crate::money::Money;
use crate::store::{AccountStore, InMemoryAccountStore};
use crate::transaction::{
    Channel, CorrelationId, Direction, IdempotencyKey, TransactionId, TransactionRecord,
    TransactionSummary, TxKind, TxStatus,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

/// Per-account mutexes, created on first use.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl LockTable {
    /// Callers check the account exists first; entries are never removed.
    pub(crate) fn handle(&self, id: AccountId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Which daily limit a debit counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LimitKind {
    Withdrawal,
    Transfer,
}

impl LimitKind {
    fn name(self) -> &'static str {
        match self {
            LimitKind::Withdrawal => "withdrawal",
            LimitKind::Transfer => "transfer",
        }
    }

    fn tx_kind(self) -> TxKind {
        match self {
            LimitKind::Withdrawal => TxKind::Withdrawal,
            LimitKind::Transfer => TxKind::Transfer,
        }
    }
}

/// Direction of an admin adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentIntent {
    Credit,
    Debit,
}

impl From<AdjustmentIntent> for Direction {
    fn from(intent: AdjustmentIntent) -> Self {
        match intent {
            AdjustmentIntent::Credit => Direction::Credit,
            AdjustmentIntent::Debit => Direction::Debit,
        }
    }
}

/// A fully described balance movement, ready to apply.
#[derive(Debug, Clone)]
pub(crate) struct Posting {
    pub account: AccountId,
    pub kind: TxKind,
    pub direction: Direction,
    pub amount: Money,
    pub description: String,
    pub channel: Channel,
    pub counterparty: Option<AccountId>,
    pub correlation: Option<CorrelationId>,
    pub reverses: Option<TransactionId>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub effective_at: Option<DateTime<Utc>>,
    /// Debit limit to enforce, if any.
    pub daily_limit: Option<LimitKind>,
    /// Frozen accounts accept the posting (compensations only).
    pub allow_frozen: bool,
}

impl Posting {
    pub(crate) fn new(
        account: AccountId,
        kind: TxKind,
        direction: Direction,
        amount: Money,
        description: impl Into<String>,
        channel: Channel,
    ) -> Self {
        Posting {
            account,
            kind,
            direction,
            amount,
            description: description.into(),
            channel,
            counterparty: None,
            correlation: None,
            reverses: None,
            idempotency_key: None,
            effective_at: None,
            daily_limit: None,
            allow_frozen: false,
        }
    }

    fn draft(&self, now: DateTime<Utc>) -> TransactionRecord {
        let mut record = TransactionRecord::pending(
            self.account,
            self.kind,
            self.direction,
            self.amount,
            self.description.clone(),
            self.channel,
            now,
        )
        .with_idempotency_key(self.idempotency_key.clone())
        .with_effective_at(self.effective_at.unwrap_or(now));
        if let Some(counterparty) = self.counterparty {
            record = record.with_counterparty(counterparty);
        }
        if let Some(correlation) = self.correlation {
            record = record.with_correlation(correlation);
        }
        if let Some(original) = self.reverses {
            record = record.reversing(original);
        }
        record
    }
}

/// Filters for [`Ledger::history`].
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub limit: usize,
    pub offset: usize,
    /// First day included (UTC).
    pub start_date: Option<NaiveDate>,
    /// Last day included (UTC), through the end of that day.
    pub end_date: Option<NaiveDate>,
    pub kind: Option<TxKind>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        HistoryQuery {
            limit: 50,
            offset: 0,
            start_date: None,
            end_date: None,
            kind: None,
        }
    }
}

impl HistoryQuery {
    fn range(&self) -> Option<DateRange> {
        if self.start_date.is_none() && self.end_date.is_none() {
            return None;
        }
        let start = self
            .start_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = self
            .end_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|dt| dt.and_utc().checked_add_signed(Duration::days(1)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(DateRange::new(start, end))
    }
}

/// Converts a boundary amount into money, rejecting anything below one cent.
pub(crate) fn positive_amount(amount_minor: i64) -> Result<Money> {
    if amount_minor <= 0 {
        return Err(LedgerError::InvalidInput(format!(
            "amount must be positive, got {amount_minor} minor units"
        )));
    }
    Ok(Money::from_minor(amount_minor))
}

/// The ledger engine.
pub struct Ledger {
    pub(crate) store: Arc<dyn AccountStore>,
    pub(crate) journal: Arc<dyn TransactionLog>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: LedgerConfig,
    pub(crate) locks: LockTable,
    idempotency: IdempotencyCache<TransactionSummary>,
}

impl Ledger {
    /// Creates a ledger over the given store and log with the system clock
    /// and default configuration.
    pub fn new(store: Arc<dyn AccountStore>, journal: Arc<dyn TransactionLog>) -> Self {
        Ledger {
            store,
            journal,
            clock: Arc::new(SystemClock),
            config: LedgerConfig::default(),
            locks: LockTable::default(),
            idempotency: IdempotencyCache::new(),
        }
    }

    /// A ledger over fresh in-memory storage.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryAccountStore::new()),
            Arc::new(InMemoryTransactionLog::new()),
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Read access to the transaction log.
    pub fn journal(&self) -> &dyn TransactionLog {
        self.journal.as_ref()
    }

    // ---------------------------------------------------------------------
    // Account lifecycle
    // ---------------------------------------------------------------------

    /// Opens an account with an opening deposit of `opening_minor` (>= 0).
    pub fn open_account(
        &self,
        owner: OwnerId,
        class: AccountClass,
        opening_minor: i64,
        options: Option<AccountOptions>,
    ) -> Result<Account> {
        if opening_minor < 0 {
            return Err(LedgerError::InvalidInput(format!(
                "opening deposit must not be negative, got {opening_minor}"
            )));
        }
        let options = options.unwrap_or_else(|| AccountOptions {
            limits: self.config.default_limits,
            utc_offset_secs: self.config.default_utc_offset_secs,
            ..AccountOptions::default()
        });
        let mut rng = rand::thread_rng();

        for _ in 0..self.config.account_number_attempts {
            let number = generate_account_number(&mut rng);
            match self.store.get_account_by_number(&number) {
                Ok(_) => continue,
                Err(LedgerError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            let account = Account::open(
                owner.clone(),
                class,
                number,
                Money::from_minor(opening_minor),
                options.clone(),
                self.clock.now(),
            );
            match self.store.insert(account) {
                Ok(account) => {
                    debug!(
                        "Opened {} account {} for {} with {}",
                        class,
                        account.masked_number(),
                        owner,
                        account.balance()
                    );
                    return Ok(account);
                }
                // lost a race for the number; draw again
                Err(LedgerError::InvalidInput(msg)) => debug!("Retrying account open: {}", msg),
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::Conflict(
            "could not allocate a unique account number".to_string(),
        ))
    }

    pub fn freeze(&self, account: AccountId) -> Result<Account> {
        self.change_status(account, AccountStatus::Frozen)
    }

    pub fn unfreeze(&self, account: AccountId) -> Result<Account> {
        self.change_status(account, AccountStatus::Active)
    }

    /// Closes an account. The balance must be zero.
    pub fn close(&self, account: AccountId) -> Result<Account> {
        self.change_status(account, AccountStatus::Closed)
    }

    fn change_status(&self, id: AccountId, next: AccountStatus) -> Result<Account> {
        let handle = self.lock_for(id)?;
        let _guard = handle.lock();
        self.with_retry("status change", || {
            let mut account = self.store.get_account(id)?;
            if next == AccountStatus::Closed && !account.balance().is_zero() {
                return Err(LedgerError::InvalidInput(format!(
                    "account {} still holds {}",
                    account.masked_number(),
                    account.balance()
                )));
            }
            account.transition(next)?;
            let stored = self.store.persist(&account)?;
            debug!("Account {} is now {}", stored.masked_number(), next);
            Ok(stored)
        })
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Lock for an existing account. Unknown ids never get a table entry.
    pub(crate) fn lock_for(&self, id: AccountId) -> Result<Arc<Mutex<()>>> {
        self.store.get_account(id)?;
        Ok(self.locks.handle(id))
    }

    /// Reads an account under its lock, so a mutation is seen whole or not at all.
    pub fn get_account(&self, id: AccountId) -> Result<Account> {
        let handle = self.lock_for(id)?;
        let _guard = handle.lock();
        self.store.get_account(id)
    }

    pub fn get_account_by_number(&self, number: &str) -> Result<Account> {
        let id = self.store.get_account_by_number(number)?.id();
        self.get_account(id)
    }

    pub fn accounts_for_owner(&self, owner: &OwnerId) -> Result<Vec<Account>> {
        self.store
            .list_accounts_for_owner(owner)?
            .iter()
            .map(|account| self.get_account(account.id()))
            .collect()
    }

    /// Transaction history for an account, newest first.
    pub fn history(&self, account: AccountId, query: &HistoryQuery) -> Result<Vec<TransactionSummary>> {
        let handle = self.lock_for(account)?;
        let _guard = handle.lock();
        let records = self.journal.find_filtered(
            account,
            query.kind,
            query.limit,
            query.offset,
            query.range(),
        )?;
        Ok(records.iter().map(TransactionRecord::summary).collect())
    }

    /// Recomputes the balance from the opening deposit and the completed
    /// records, returning `(recorded, reconstructed)`.
    pub fn reconcile(&self, account: AccountId) -> Result<(Money, Money)> {
        let handle = self.lock_for(account)?;
        let _guard = handle.lock();
        let acc = self.store.get_account(account)?;
        let reconstructed = acc.opening_balance()
            + self
                .journal
                .all_for_account(account)?
                .iter()
                .map(TransactionRecord::net_effect)
                .sum::<Money>();
        if reconstructed != acc.balance() {
            error!(
                "Account {} balance {} does not match its history ({})",
                acc.masked_number(),
                acc.balance(),
                reconstructed
            );
        }
        Ok((acc.balance(), reconstructed))
    }

    // ---------------------------------------------------------------------
    // Record edits (always refused once completed)
    // ---------------------------------------------------------------------

    pub fn amend_record(&self, id: TransactionId, amendment: Amendment) -> Result<TransactionRecord> {
        self.journal.amend(id, amendment).map_err(Self::loud)
    }

    pub fn update_record_status(&self, id: TransactionId, status: TxStatus) -> Result<TransactionRecord> {
        self.journal.update_status(id, status).map_err(Self::loud)
    }

    fn loud(err: LedgerError) -> LedgerError {
        if err.is_fatal() {
            error!("Ledger invariant violation: {}", err);
        }
        err
    }

    // ---------------------------------------------------------------------
    // Balance mutations
    // ---------------------------------------------------------------------

    /// Credits `amount_minor` to an active account.
    pub fn apply_deposit(
        &self,
        account: AccountId,
        amount_minor: i64,
        description: &str,
        channel: Channel,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<TransactionSummary> {
        let amount = positive_amount(amount_minor)?;
        let mut posting = Posting::new(
            account,
            TxKind::Deposit,
            Direction::Credit,
            amount,
            description,
            channel,
        );
        posting.idempotency_key = idempotency_key;
        self.run_single("deposit", posting)
    }

    /// Debits `amount_minor` from an active account, subject to available
    /// balance and the daily withdrawal limit.
    pub fn apply_withdrawal(
        &self,
        account: AccountId,
        amount_minor: i64,
        description: &str,
        channel: Channel,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<TransactionSummary> {
        let amount = positive_amount(amount_minor)?;
        let mut posting = Posting::new(
            account,
            TxKind::Withdrawal,
            Direction::Debit,
            amount,
            description,
            channel,
        );
        posting.idempotency_key = idempotency_key;
        posting.daily_limit = Some(LimitKind::Withdrawal);
        self.run_single("withdrawal", posting)
    }

    /// Privileged credit or debit, always on the `admin` channel and exempt
    /// from daily limits.
    pub fn apply_admin_adjustment(
        &self,
        account: AccountId,
        intent: AdjustmentIntent,
        amount_minor: i64,
        description: &str,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<TransactionSummary> {
        self.admin_adjustment(account, intent, amount_minor, description, None, idempotency_key)
    }

    /// Like [`Ledger::apply_admin_adjustment`] with a chosen effective date.
    pub fn apply_admin_adjustment_at(
        &self,
        account: AccountId,
        intent: AdjustmentIntent,
        amount_minor: i64,
        description: &str,
        effective_at: DateTime<Utc>,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<TransactionSummary> {
        self.admin_adjustment(
            account,
            intent,
            amount_minor,
            description,
            Some(effective_at),
            idempotency_key,
        )
    }

    fn admin_adjustment(
        &self,
        account: AccountId,
        intent: AdjustmentIntent,
        amount_minor: i64,
        description: &str,
        effective_at: Option<DateTime<Utc>>,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<TransactionSummary> {
        let amount = positive_amount(amount_minor)?;
        let description = if description.trim().is_empty() {
            "Admin funded user account"
        } else {
            description
        };
        let mut posting = Posting::new(
            account,
            TxKind::Adjustment,
            intent.into(),
            amount,
            description,
            Channel::Admin,
        );
        posting.idempotency_key = idempotency_key;
        posting.effective_at = effective_at;
        self.run_single("adjustment", posting)
    }

    /// Debits a fee on the `system` channel.
    pub fn apply_fee(&self, account: AccountId, amount_minor: i64, description: &str) -> Result<TransactionSummary> {
        let amount = positive_amount(amount_minor)?;
        let posting = Posting::new(account, TxKind::Fee, Direction::Debit, amount, description, Channel::System);
        self.run_single("fee", posting)
    }

    /// Credits interest on the `system` channel.
    pub fn post_interest(&self, account: AccountId, amount_minor: i64, description: &str) -> Result<TransactionSummary> {
        let amount = positive_amount(amount_minor)?;
        let posting = Posting::new(
            account,
            TxKind::Interest,
            Direction::Credit,
            amount,
            description,
            Channel::System,
        );
        self.run_single("interest", posting)
    }

    /// Takes the account lock, honours the idempotency key, applies.
    fn run_single(&self, operation: &'static str, posting: Posting) -> Result<TransactionSummary> {
        let handle = self.lock_for(posting.account)?;
        let _guard = handle.lock();

        let fingerprint = RequestFingerprint::new(operation, &[posting.account], posting.amount);
        let key = match posting.idempotency_key.clone() {
            Some(key) => key,
            None => return Ok(self.post_locked(&posting)?.summary()),
        };
        if let Claim::Replay(previous) = self.idempotency.claim(&key, &fingerprint)? {
            debug!("Replayed {} for idempotency key {}", operation, key);
            return Ok(previous);
        }
        match self.post_locked(&posting) {
            Ok(record) => {
                let summary = record.summary();
                self.idempotency.complete(key, fingerprint, summary.clone());
                Ok(summary)
            }
            Err(err) => {
                self.idempotency.release(&key);
                Err(err)
            }
        }
    }

    /// Applies a posting with bounded retries. The caller holds the lock.
    ///
    /// A posting that gives up after its record was staged leaves that
    /// record failed.
    pub(crate) fn post_locked(&self, posting: &Posting) -> Result<TransactionRecord> {
        let mut staged = None;
        let result = self.with_retry(&posting.kind.to_string(), || {
            self.try_post(posting, &mut staged)
        });
        if let (Err(err), Some(record)) = (&result, staged) {
            self.abandon(record, err);
        }
        result
    }

    fn try_post(&self, posting: &Posting, staged: &mut Option<TransactionRecord>) -> Result<TransactionRecord> {
        let mut account = self.store.get_account(posting.account)?;
        if posting.allow_frozen {
            account.ensure_open()?;
        } else {
            account.ensure_active()?;
        }
        if posting.direction == Direction::Debit {
            account.ensure_covers(posting.amount)?;
            if let Some(limit) = posting.daily_limit {
                self.check_daily_limit(&account, limit, posting.amount)?;
            }
        }
        let projected = posting.direction.apply(account.balance(), posting.amount);
        if projected.to_minor().is_none() {
            return Err(LedgerError::InvalidInput(format!(
                "{} of {} would take account {} outside the representable balance range",
                posting.kind,
                posting.amount,
                account.masked_number()
            )));
        }

        let now = self.clock.now();
        let snapshot = account.clone();
        let (before, after) = match posting.direction {
            Direction::Credit => account.credit(posting.amount),
            Direction::Debit => account.debit(posting.amount),
        };

        let pending = self.stage(posting, staged, before, after, now)?;
        let stored = self.store.persist(&account)?;
        match self.journal.update_status(pending.id, TxStatus::Completed) {
            Ok(record) => {
                debug!(
                    "{} {} {} on {}: {} -> {}",
                    record.kind,
                    record.direction,
                    record.amount,
                    stored.masked_number(),
                    before,
                    after
                );
                if stored.is_below_minimum() {
                    warn!(
                        "Account {} balance {} is below its minimum {}",
                        stored.masked_number(),
                        stored.balance(),
                        stored.minimum_balance()
                    );
                }
                Ok(record)
            }
            Err(err) => {
                warn!(
                    "Completing {} on {} failed, restoring balance {}: {}",
                    posting.kind,
                    stored.masked_number(),
                    before,
                    err
                );
                self.roll_back(snapshot, stored.version())?;
                Err(err)
            }
        }
    }

    /// Appends the pending record on the first attempt and refreshes its
    /// snapshots on later ones.
    fn stage(
        &self,
        posting: &Posting,
        staged: &mut Option<TransactionRecord>,
        before: Money,
        after: Money,
        now: DateTime<Utc>,
    ) -> Result<TransactionRecord> {
        let record = match staged {
            None => self.journal.append(posting.draft(now).staged(before, after, now))?,
            Some(record) if record.balance_before == before && record.balance_after == after => {
                record.clone()
            }
            Some(record) => self.journal.amend(
                record.id,
                Amendment {
                    balance_before: Some(before),
                    balance_after: Some(after),
                    ..Amendment::default()
                },
            )?,
        };
        *staged = Some(record.clone());
        Ok(record)
    }

    /// Marks a staged record failed after its posting gave up.
    fn abandon(&self, record: TransactionRecord, cause: &LedgerError) {
        let unmoved = Amendment {
            balance_after: Some(record.balance_before),
            ..Amendment::default()
        };
        let outcome = self
            .journal
            .amend(record.id, unmoved)
            .and_then(|_| self.journal.update_status(record.id, TxStatus::Failed));
        match outcome {
            Ok(_) => debug!("Transaction {} failed: {}", record.id, cause),
            Err(err) => warn!(
                "Transaction {} stays pending, could not mark it failed after {}: {}",
                record.id, cause, err
            ),
        }
    }

    /// Restores `snapshot` over the row currently at `current_version`.
    fn roll_back(&self, mut snapshot: Account, current_version: u64) -> Result<()> {
        snapshot.version = current_version;
        self.store.persist(&snapshot).map(|_| ()).map_err(|err| {
            error!(
                "Rollback of account {} failed, balance and log disagree: {}",
                snapshot.id(),
                err
            );
            LedgerError::ReconciliationRequired {
                reference: snapshot.id().to_string(),
                reason: format!("rollback failed: {err}"),
            }
        })
    }

    /// Appends a failed record for a posting that never reached the log.
    pub(crate) fn record_failure(&self, posting: &Posting) -> Result<TransactionRecord> {
        let balance = self.store.get_account(posting.account)?.balance();
        let now = self.clock.now();
        self.journal.append(posting.draft(now).fail(balance, now))
    }

    /// Fails if debiting `amount` would exceed today's `limit` for the account.
    pub(crate) fn check_daily_limit(&self, account: &Account, limit: LimitKind, amount: Money) -> Result<()> {
        let cap = match limit {
            LimitKind::Withdrawal => account.limits().withdrawal,
            LimitKind::Transfer => account.limits().transfer,
        };
        let (start, end) = account.day_bounds(self.clock.now());
        let used = self.journal.sum_by_kind_and_date_range(
            account.id(),
            limit.tx_kind(),
            Direction::Debit,
            start,
            end,
        )?;
        if used + amount > cap {
            return Err(LedgerError::DailyLimitExceeded {
                account: account.id().to_string(),
                operation: limit.name(),
                limit: cap.to_string(),
                used: used.to_string(),
                requested: amount.to_string(),
            });
        }
        Ok(())
    }

    /// Runs `op`, retrying `Conflict`/`StorageTimeout` with backoff.
    pub(crate) fn with_retry<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        what, err, attempt, self.config.max_retries, delay
                    );
                    thread::sleep(delay);
                }
                result => return result,
            }
        }
    }
}
