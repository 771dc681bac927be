//! Append-only transaction log.
//!
//! Records are inserted once. The only state change a stored record may
//! undergo is `pending -> completed | failed`; financial fields of a
//! completed record can never change.

use crate::account::AccountId;
use crate::error::{LedgerError, Result};
use crate::money::Money;
use crate::transaction::{CorrelationId, Direction, TransactionId, TransactionRecord, TxKind, TxStatus};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::error;

/// Half-open time window `[start, end)` over `effective_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        DateRange { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Requested edit of a stored record's financial fields.
#[derive(Debug, Clone, Default)]
pub struct Amendment {
    pub amount: Option<Money>,
    pub balance_before: Option<Money>,
    pub balance_after: Option<Money>,
    pub description: Option<String>,
}

/// Storage and query of transaction records.
pub trait TransactionLog: Send + Sync {
    /// Stores a new record. Fails with `DuplicateTransactionId` on id reuse.
    fn append(&self, record: TransactionRecord) -> Result<TransactionRecord>;

    fn get(&self, id: TransactionId) -> Result<TransactionRecord>;

    /// Moves a pending record to `status`.
    fn update_status(&self, id: TransactionId, status: TxStatus) -> Result<TransactionRecord>;

    /// Edits a pending record. Completed records reject every amendment.
    fn amend(&self, id: TransactionId, amendment: Amendment) -> Result<TransactionRecord>;

    /// Records for `account`, newest first, optionally restricted to one kind.
    fn find_filtered(
        &self,
        account: AccountId,
        kind: Option<TxKind>,
        limit: usize,
        offset: usize,
        range: Option<DateRange>,
    ) -> Result<Vec<TransactionRecord>>;

    /// Records for `account`, newest first.
    fn find_by_account(
        &self,
        account: AccountId,
        limit: usize,
        offset: usize,
        range: Option<DateRange>,
    ) -> Result<Vec<TransactionRecord>> {
        self.find_filtered(account, None, limit, offset, range)
    }

    /// Total of completed `kind` movements in `direction` on `account`
    /// with `effective_at` in `[start, end)`.
    fn sum_by_kind_and_date_range(
        &self,
        account: AccountId,
        kind: TxKind,
        direction: Direction,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Money>;

    fn find_by_correlation(&self, correlation: CorrelationId) -> Result<Vec<TransactionRecord>>;

    /// Every record for `account` in append order.
    fn all_for_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory log: records by id plus a per-account append-order index.
#[derive(Default)]
pub struct InMemoryTransactionLog {
    records: DashMap<TransactionId, TransactionRecord>,
    by_account: DashMap<AccountId, Vec<TransactionId>>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn records_for(&self, account: AccountId) -> Vec<TransactionRecord> {
        let ids = match self.by_account.get(&account) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .collect()
    }
}

impl TransactionLog for InMemoryTransactionLog {
    fn append(&self, record: TransactionRecord) -> Result<TransactionRecord> {
        if !record.is_consistent() {
            return Err(LedgerError::InvalidInput(format!(
                "record {} has inconsistent balance snapshots",
                record.id
            )));
        }
        match self.records.entry(record.id) {
            Entry::Occupied(_) => return Err(LedgerError::DuplicateTransactionId(record.id)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        self.by_account
            .entry(record.account_id)
            .or_default()
            .push(record.id);
        Ok(record)
    }

    fn get(&self, id: TransactionId) -> Result<TransactionRecord> {
        self.records
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| LedgerError::transaction_not_found(id))
    }

    fn update_status(&self, id: TransactionId, status: TxStatus) -> Result<TransactionRecord> {
        let mut slot = self
            .records
            .get_mut(&id)
            .ok_or_else(|| LedgerError::transaction_not_found(id))?;
        if slot.status != TxStatus::Pending {
            error!(
                "Rejected status change {} -> {} on transaction {}",
                slot.status, status, id
            );
            return Err(LedgerError::ImmutableRecord(id));
        }
        let mut updated = slot.clone();
        updated.status = status;
        if !updated.is_consistent() {
            return Err(LedgerError::InvalidInput(format!(
                "record {id} cannot complete with inconsistent snapshots"
            )));
        }
        *slot = updated.clone();
        Ok(updated)
    }

    fn amend(&self, id: TransactionId, amendment: Amendment) -> Result<TransactionRecord> {
        let mut slot = self
            .records
            .get_mut(&id)
            .ok_or_else(|| LedgerError::transaction_not_found(id))?;
        if slot.status != TxStatus::Pending {
            error!("Rejected amendment of {} transaction {}", slot.status, id);
            return Err(LedgerError::ImmutableRecord(id));
        }
        let mut updated = slot.clone();
        if let Some(amount) = amendment.amount {
            updated.amount = amount;
        }
        if let Some(before) = amendment.balance_before {
            updated.balance_before = before;
        }
        if let Some(after) = amendment.balance_after {
            updated.balance_after = after;
        }
        if let Some(description) = amendment.description {
            updated.description = description;
        }
        if !updated.is_consistent() {
            return Err(LedgerError::InvalidInput(format!(
                "amendment leaves record {id} inconsistent"
            )));
        }
        *slot = updated.clone();
        Ok(updated)
    }

    fn find_filtered(
        &self,
        account: AccountId,
        kind: Option<TxKind>,
        limit: usize,
        offset: usize,
        range: Option<DateRange>,
    ) -> Result<Vec<TransactionRecord>> {
        let mut records: Vec<TransactionRecord> = self
            .records_for(account)
            .into_iter()
            .rev()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .filter(|r| range.map_or(true, |range| range.contains(r.effective_at)))
            .collect();
        // stable sort keeps later appends first among equal timestamps
        records.sort_by(|a, b| b.effective_at.cmp(&a.effective_at));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    fn sum_by_kind_and_date_range(
        &self,
        account: AccountId,
        kind: TxKind,
        direction: Direction,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Money> {
        let range = DateRange::new(start, end);
        Ok(self
            .records_for(account)
            .iter()
            .filter(|r| {
                r.is_completed()
                    && r.kind == kind
                    && r.direction == direction
                    && range.contains(r.effective_at)
            })
            .map(|r| r.amount)
            .sum())
    }

    fn find_by_correlation(&self, correlation: CorrelationId) -> Result<Vec<TransactionRecord>> {
        let mut records: Vec<TransactionRecord> = self
            .records
            .iter()
            .filter(|r| r.correlation_id == Some(correlation))
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    fn all_for_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        Ok(self.records_for(account))
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
