//! Transaction record model and the summaries handed to callers.
//!
//! Direction is structural: every record names the account whose balance
//! it moved and whether that movement was a credit or a debit. Amounts are
//! always positive.

use crate::account::AccountId;
use crate::error::{LedgerError, Result};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by the legs of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token that makes a retried request safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl From<&str> for IdempotencyKey {
    fn from(s: &str) -> Self {
        IdempotencyKey(s.to_string())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of operation produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Deposit,
    Withdrawal,
    Transfer,
    Adjustment,
    Fee,
    Interest,
    Reversal,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxKind::Deposit => "deposit",
            TxKind::Withdrawal => "withdrawal",
            TxKind::Transfer => "transfer",
            TxKind::Adjustment => "adjustment",
            TxKind::Fee => "fee",
            TxKind::Interest => "interest",
            TxKind::Reversal => "reversal",
        };
        f.write_str(s)
    }
}

impl FromStr for TxKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "deposit" => Ok(TxKind::Deposit),
            "withdrawal" => Ok(TxKind::Withdrawal),
            "transfer" => Ok(TxKind::Transfer),
            "adjustment" => Ok(TxKind::Adjustment),
            "fee" => Ok(TxKind::Fee),
            "interest" => Ok(TxKind::Interest),
            "reversal" => Ok(TxKind::Reversal),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown transaction kind {other:?}"
            ))),
        }
    }
}

/// Which way money moved on the record's account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    /// The balance that results from moving `amount` this way from `before`.
    pub fn apply(self, before: Money, amount: Money) -> Money {
        match self {
            Direction::Credit => before + amount,
            Direction::Debit => before - amount,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Credit => f.write_str("credit"),
            Direction::Debit => f.write_str("debit"),
        }
    }
}

/// Where a request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Online,
    Admin,
    Atm,
    Branch,
    System,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Online => "online",
            Channel::Admin => "admin",
            Channel::Atm => "atm",
            Channel::Branch => "branch",
            Channel::System => "system",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Pending => "pending",
            TxStatus::Completed => "completed",
            TxStatus::Failed => "failed",
            TxStatus::Reversed => "reversed",
        };
        f.write_str(s)
    }
}

/// One balance movement on one account.
///
/// # Invariants
///
/// - `amount > 0`
/// - once `Completed`, `balance_after == direction.apply(balance_before, amount)`
///   and the record never changes again
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    /// Account whose balance snapshots this record carries.
    pub account_id: AccountId,
    /// Other side of a transfer, if any.
    pub counterparty_id: Option<AccountId>,
    pub kind: TxKind,
    pub direction: Direction,
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub description: String,
    pub channel: Channel,
    pub status: TxStatus,
    pub correlation_id: Option<CorrelationId>,
    /// Record this one compensates.
    pub reverses: Option<TransactionId>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub created_at: DateTime<Utc>,
    pub effective_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    /// Creates a pending record with a fresh id.
    pub fn pending(
        account_id: AccountId,
        kind: TxKind,
        direction: Direction,
        amount: Money,
        description: impl Into<String>,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Self {
        TransactionRecord {
            id: TransactionId::new(),
            account_id,
            counterparty_id: None,
            kind,
            direction,
            amount,
            balance_before: Money::ZERO,
            balance_after: Money::ZERO,
            description: description.into(),
            channel,
            status: TxStatus::Pending,
            correlation_id: None,
            reverses: None,
            idempotency_key: None,
            created_at: now,
            effective_at: now,
            processed_at: None,
        }
    }

    pub fn with_counterparty(mut self, counterparty: AccountId) -> Self {
        self.counterparty_id = Some(counterparty);
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationId) -> Self {
        self.correlation_id = Some(correlation);
        self
    }

    pub fn reversing(mut self, original: TransactionId) -> Self {
        self.reverses = Some(original);
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<IdempotencyKey>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_effective_at(mut self, effective: DateTime<Utc>) -> Self {
        self.effective_at = effective;
        self
    }

    /// Fills in the snapshots of a mutation about to be applied. The record
    /// stays pending until the balance write has gone through.
    pub(crate) fn staged(mut self, before: Money, after: Money, now: DateTime<Utc>) -> Self {
        self.balance_before = before;
        self.balance_after = after;
        self.processed_at = Some(now);
        self
    }

    /// Marks the record completed with the snapshots of the applied mutation.
    pub fn complete(mut self, before: Money, after: Money, now: DateTime<Utc>) -> Self {
        self.balance_before = before;
        self.balance_after = after;
        self.status = TxStatus::Completed;
        self.processed_at = Some(now);
        debug_assert!(self.is_consistent());
        self
    }

    /// Marks the record failed; the balance did not move.
    pub(crate) fn fail(mut self, balance: Money, now: DateTime<Utc>) -> Self {
        self.balance_before = balance;
        self.balance_after = balance;
        self.status = TxStatus::Failed;
        self.processed_at = Some(now);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == TxStatus::Completed
    }

    /// Snapshot check: completed records must move the balance by exactly
    /// `amount` in their direction. Other statuses have nothing to check.
    pub fn is_consistent(&self) -> bool {
        if !self.amount.is_positive() {
            return false;
        }
        match self.status {
            TxStatus::Completed => {
                self.direction.apply(self.balance_before, self.amount) == self.balance_after
            }
            _ => true,
        }
    }

    /// Signed effect of the record on its account, zero unless completed.
    pub fn net_effect(&self) -> Money {
        if !self.is_completed() {
            return Money::ZERO;
        }
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }

    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id,
            kind: self.kind,
            direction: self.direction,
            amount_minor: minor_units(self.amount),
            description: self.description.clone(),
            effective_date: self.effective_at,
            status: self.status,
            balance_after_minor: minor_units(self.balance_after),
            correlation_id: self.correlation_id,
        }
    }
}

// The ledger refuses any movement that would leave a balance outside the
// i64 minor-unit range, so the bound is never hit for stored records.
fn minor_units(amount: Money) -> i64 {
    amount
        .to_minor()
        .unwrap_or(if amount.is_negative() { i64::MIN } else { i64::MAX })
}

/// Boundary view of a record, amounts in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    pub id: TransactionId,
    pub kind: TxKind,
    pub direction: Direction,
    pub amount_minor: i64,
    pub description: String,
    pub effective_date: DateTime<Utc>,
    pub status: TxStatus,
    pub balance_after_minor: i64,
    pub correlation_id: Option<CorrelationId>,
}

/// Final state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferOutcome {
    Completed,
    Reversed,
}

/// Boundary view of a transfer.
///
/// For a `Reversed` outcome `credit` is the compensating credit posted back
/// to the source, and `failed_credit` holds the attempted destination leg
/// when it could be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub correlation_id: CorrelationId,
    pub debit: TransactionSummary,
    pub credit: TransactionSummary,
    pub failed_credit: Option<TransactionSummary>,
    pub outcome: TransferOutcome,
}
