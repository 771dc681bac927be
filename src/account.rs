//! Account model and balance rules.
//!
//! Balance fields are crate-private: only the ledger engine changes them,
//! everything else reads through accessors.

use crate::error::{LedgerError, Result};
use crate::money::Money;
use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    pub fn new() -> Self {
        AccountId(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(AccountId)
            .map_err(|e| LedgerError::InvalidInput(format!("malformed account id {s:?}: {e}")))
    }
}

/// Reference to the account's primary owner, as issued by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        OwnerId(s.to_string())
    }
}

/// Product class of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountClass {
    Savings,
    Current,
    Checking,
}

impl fmt::Display for AccountClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountClass::Savings => "savings",
            AccountClass::Current => "current",
            AccountClass::Checking => "checking",
        };
        f.write_str(s)
    }
}

impl FromStr for AccountClass {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "savings" => Ok(AccountClass::Savings),
            "current" => Ok(AccountClass::Current),
            "checking" => Ok(AccountClass::Checking),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown account class {other:?}"
            ))),
        }
    }
}

/// Lifecycle status of an account.
///
/// `Active` and `Frozen` may swap; both may move to `Closed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

impl AccountStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: AccountStatus) -> bool {
        use AccountStatus::*;
        matches!(
            (self, next),
            (Active, Frozen) | (Frozen, Active) | (Active, Closed) | (Frozen, Closed)
        )
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountStatus::Active => "active",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Per-operation daily limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLimits {
    pub withdrawal: Money,
    pub transfer: Money,
    pub purchase: Money,
}

impl Default for DailyLimits {
    fn default() -> Self {
        DailyLimits {
            withdrawal: Money::from_minor(50_000),
            transfer: Money::from_minor(100_000),
            purchase: Money::from_minor(100_000),
        }
    }
}

/// Optional settings applied when an account is opened.
#[derive(Debug, Clone, Default)]
pub struct AccountOptions {
    pub limits: DailyLimits,
    pub minimum_balance: Money,
    /// Overdraft allowance; `None` means no overdraft.
    pub overdraft_limit: Option<Money>,
    /// Offset from UTC, in seconds, of the account's calendar day.
    pub utc_offset_secs: i32,
}

/// A bank account.
///
/// # Invariants
///
/// - `balance >= 0`, or `balance >= -overdraft_limit` when an overdraft is set
/// - `available_balance() == balance + overdraft` while active, else `balance`
/// - `Closed` is terminal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    pub(crate) id: AccountId,
    pub(crate) number: String,
    pub(crate) owner: OwnerId,
    pub(crate) class: AccountClass,
    pub(crate) balance: Money,
    pub(crate) opening_balance: Money,
    pub(crate) status: AccountStatus,
    pub(crate) limits: DailyLimits,
    pub(crate) minimum_balance: Money,
    pub(crate) overdraft_limit: Option<Money>,
    pub(crate) utc_offset_secs: i32,
    /// Bumped by the store on every successful persist.
    pub(crate) version: u64,
    pub(crate) created_at: DateTime<Utc>,
}

impl Account {
    /// Builds a fresh account; the store assigns nothing, so the number must
    /// already be unique.
    pub(crate) fn open(
        owner: OwnerId,
        class: AccountClass,
        number: String,
        opening_balance: Money,
        options: AccountOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Account {
            id: AccountId::new(),
            number,
            owner,
            class,
            balance: opening_balance,
            opening_balance,
            status: AccountStatus::Active,
            limits: options.limits,
            minimum_balance: options.minimum_balance,
            overdraft_limit: options.overdraft_limit,
            utc_offset_secs: options.utc_offset_secs,
            version: 0,
            created_at: now,
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    /// Display form of the account number: first four digits, `****`, last two.
    pub fn masked_number(&self) -> String {
        mask_account_number(&self.number)
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn class(&self) -> AccountClass {
        self.class
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    pub fn opening_balance(&self) -> Money {
        self.opening_balance
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn limits(&self) -> &DailyLimits {
        &self.limits
    }

    pub fn minimum_balance(&self) -> Money {
        self.minimum_balance
    }

    pub fn overdraft_limit(&self) -> Option<Money> {
        self.overdraft_limit
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn is_closed(&self) -> bool {
        self.status == AccountStatus::Closed
    }

    /// Balance plus the overdraft allowance, which only counts while active.
    pub fn available_balance(&self) -> Money {
        match self.overdraft_limit {
            Some(limit) if self.is_active() => self.balance + limit,
            _ => self.balance,
        }
    }

    /// Returns `true` if the balance sits below the advisory minimum.
    pub fn is_below_minimum(&self) -> bool {
        self.balance < self.minimum_balance
    }

    /// Fails unless the account is active.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(self.inactive_error())
        }
    }

    /// Fails only for closed accounts.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.inactive_error())
        } else {
            Ok(())
        }
    }

    fn inactive_error(&self) -> LedgerError {
        LedgerError::AccountInactive {
            account: self.id.to_string(),
            status: self.status.to_string(),
        }
    }

    /// Checks that a debit of `amount` is covered by the available balance.
    pub(crate) fn ensure_covers(&self, amount: Money) -> Result<()> {
        let available = self.available_balance();
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: self.id.to_string(),
                available: available.to_string(),
                requested: amount.to_string(),
            });
        }
        Ok(())
    }

    /// Adds `amount` and returns the `(before, after)` balances.
    pub(crate) fn credit(&mut self, amount: Money) -> (Money, Money) {
        let before = self.balance;
        self.balance += amount;
        (before, self.balance)
    }

    /// Subtracts `amount` and returns the `(before, after)` balances.
    ///
    /// Callers check coverage first; this only asserts it in debug builds.
    pub(crate) fn debit(&mut self, amount: Money) -> (Money, Money) {
        let before = self.balance;
        self.balance -= amount;
        debug_assert!(self.check_invariant(), "balance below allowed floor");
        (before, self.balance)
    }

    /// Moves the account to `next`, rejecting illegal transitions.
    pub(crate) fn transition(&mut self, next: AccountStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::InvalidInput(format!(
                "account {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// The account's timezone as a fixed UTC offset.
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }

    /// UTC bounds `[start, end)` of the calendar day containing `now` in the
    /// account's timezone.
    pub fn day_bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let tz = self.timezone();
        let local_date = now.with_timezone(&tz).date_naive();
        let start = local_date
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| tz.from_local_datetime(&midnight).single())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        (start, start + Duration::days(1))
    }

    /// Verifies the balance floor invariant.
    pub fn check_invariant(&self) -> bool {
        let floor = self.overdraft_limit.map(|l| -l).unwrap_or(Money::ZERO);
        self.balance >= floor
    }
}

/// Masks an account number for display: `1234****90`.
pub fn mask_account_number(number: &str) -> String {
    if number.len() <= 6 {
        return "*".repeat(number.len());
    }
    format!("{}****{}", &number[..4], &number[number.len() - 2..])
}

/// Generates a random 10-digit account number.
pub(crate) fn generate_account_number<R: Rng + ?Sized>(rng: &mut R) -> String {
    rng.gen_range(1_000_000_000u64..10_000_000_000u64).to_string()
}
