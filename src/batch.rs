//! CSV batch replay of ledger operations.
//!
//! Reads operations one row at a time, applies each through the ledger or
//! the transfer orchestrator, and writes the resulting account states.
//! Rejected rows are logged at warn level and skipped; they never stop
//! the batch.
//!
//! Input columns: `op,account,target,amount,description,key`.
//! Accounts are named by caller-chosen labels; `open` binds a label to a
//! new account and takes the account class in `target`.

use crate::account::{AccountClass, AccountId};
use crate::auth::Caller;
use crate::error::{LedgerError, Result};
use crate::ledger::{AdjustmentIntent, Ledger};
use crate::money::Money;
use crate::notify::NotificationSink;
use crate::transaction::{Channel, IdempotencyKey};
use crate::transfer::TransferOrchestrator;
use csv::{ReaderBuilder, Trim};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

/// Raw operation row as read from CSV.
#[derive(Debug, Deserialize)]
pub struct OperationRecord {
    pub op: String,
    pub account: String,
    pub target: Option<String>,
    pub amount: Option<String>,
    pub description: Option<String>,
    pub key: Option<String>,
}

/// A parsed operation ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Open {
        label: String,
        class: AccountClass,
        opening_minor: i64,
    },
    Deposit(Movement),
    Withdrawal(Movement),
    Transfer {
        movement: Movement,
        to: String,
    },
    Credit(Movement),
    Debit(Movement),
    Fee(Movement),
    Interest(Movement),
    Freeze(String),
    Unfreeze(String),
    Close(String),
}

/// Shared fields of the amount-carrying operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Movement {
    pub label: String,
    pub amount_minor: i64,
    pub description: String,
    pub key: Option<IdempotencyKey>,
}

impl OperationRecord {
    /// Parses the raw row into a typed operation.
    ///
    /// Returns `None` for unknown operations, missing or malformed amounts,
    /// amounts finer than one cent, and amounts too large for `i64` cents.
    pub fn parse(&self) -> Option<Operation> {
        let label = self.account.trim().to_string();
        if label.is_empty() {
            return None;
        }
        let op = self.op.trim().to_lowercase();

        match op.as_str() {
            "open" => {
                let class = match self.target.as_deref().map(str::trim) {
                    None | Some("") => AccountClass::Savings,
                    Some(s) => AccountClass::from_str(s).ok()?,
                };
                let opening_minor = match self.non_empty(&self.amount) {
                    Some(s) => parse_amount(s)?,
                    None => 0,
                };
                if opening_minor < 0 {
                    return None;
                }
                Some(Operation::Open {
                    label,
                    class,
                    opening_minor,
                })
            }
            "deposit" => Some(Operation::Deposit(self.movement(label)?)),
            "withdrawal" => Some(Operation::Withdrawal(self.movement(label)?)),
            "transfer" => {
                let to = self.non_empty(&self.target)?.to_string();
                Some(Operation::Transfer {
                    movement: self.movement(label)?,
                    to,
                })
            }
            "credit" => Some(Operation::Credit(self.movement(label)?)),
            "debit" => Some(Operation::Debit(self.movement(label)?)),
            "fee" => Some(Operation::Fee(self.movement(label)?)),
            "interest" => Some(Operation::Interest(self.movement(label)?)),
            "freeze" => Some(Operation::Freeze(label)),
            "unfreeze" => Some(Operation::Unfreeze(label)),
            "close" => Some(Operation::Close(label)),
            _ => None,
        }
    }

    fn movement(&self, label: String) -> Option<Movement> {
        let amount_minor = parse_amount(self.non_empty(&self.amount)?)?;
        Some(Movement {
            label,
            amount_minor,
            description: self
                .description
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            key: self.non_empty(&self.key).map(IdempotencyKey::from),
        })
    }

    fn non_empty<'a>(&self, field: &'a Option<String>) -> Option<&'a str> {
        field.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Parses a decimal amount into minor units, rejecting sub-cent precision
/// and anything outside the `i64` range.
fn parse_amount(s: &str) -> Option<i64> {
    let decimal = Decimal::from_str(s.trim()).ok()?;
    if decimal.normalize().scale() > Money::SCALE {
        return None;
    }
    Money::new(decimal).to_minor()
}

/// Counts of applied and rejected rows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub rejected: usize,
}

/// Replays CSV operations against a ledger on behalf of one caller.
pub struct BatchProcessor {
    ledger: Arc<Ledger>,
    transfers: TransferOrchestrator,
    caller: Caller,
    /// Label to account, ordered for deterministic output.
    labels: BTreeMap<String, AccountId>,
}

impl BatchProcessor {
    pub fn new(ledger: Arc<Ledger>, caller: Caller) -> Self {
        BatchProcessor {
            transfers: TransferOrchestrator::new(ledger.clone()),
            ledger,
            caller,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.transfers = self.transfers.with_sink(sink);
        self
    }

    /// The account bound to `label`, if any.
    pub fn account_id(&self, label: &str) -> Option<AccountId> {
        self.labels.get(label).copied()
    }

    /// Processes operations from a CSV reader in streaming fashion.
    pub fn process_csv<R: Read>(&mut self, reader: R) -> Result<BatchReport> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);
        let mut report = BatchReport::default();

        for (row_idx, result) in csv_reader.deserialize::<OperationRecord>().enumerate() {
            let row_num = row_idx + 2; // 1-indexed, accounting for header row

            let outcome = match result {
                Ok(record) => match record.parse() {
                    Some(op) => self.apply(op, row_num),
                    None => Err(LedgerError::InvalidInput(
                        "failed to parse operation record".to_string(),
                    )),
                },
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!("Row {}: {}", row_num, e);
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    /// Applies a single parsed operation.
    pub fn apply(&mut self, op: Operation, row: usize) -> Result<()> {
        match op {
            Operation::Open {
                label,
                class,
                opening_minor,
            } => {
                if self.labels.contains_key(&label) {
                    return Err(LedgerError::InvalidInput(format!(
                        "account label {label} already in use"
                    )));
                }
                let account = self.ledger.open_account(
                    self.caller.owner.clone(),
                    class,
                    opening_minor,
                    None,
                )?;
                debug!("Row {}: opened {} as {}", row, label, account.masked_number());
                self.labels.insert(label, account.id());
            }
            Operation::Deposit(m) => {
                let id = self.owned(&m.label)?;
                self.ledger
                    .apply_deposit(id, m.amount_minor, &m.description, Channel::Branch, m.key)?;
            }
            Operation::Withdrawal(m) => {
                let id = self.owned(&m.label)?;
                self.ledger.apply_withdrawal(
                    id,
                    m.amount_minor,
                    &m.description,
                    Channel::Branch,
                    m.key,
                )?;
            }
            Operation::Transfer { movement: m, to } => {
                let from = self.owned(&m.label)?;
                let to = self.resolve(&to)?;
                self.transfers
                    .execute(from, to, m.amount_minor, &m.description, m.key)?;
            }
            Operation::Credit(m) => {
                self.caller.ensure_admin()?;
                let id = self.resolve(&m.label)?;
                self.ledger.apply_admin_adjustment(
                    id,
                    AdjustmentIntent::Credit,
                    m.amount_minor,
                    &m.description,
                    m.key,
                )?;
            }
            Operation::Debit(m) => {
                self.caller.ensure_admin()?;
                let id = self.resolve(&m.label)?;
                self.ledger.apply_admin_adjustment(
                    id,
                    AdjustmentIntent::Debit,
                    m.amount_minor,
                    &m.description,
                    m.key,
                )?;
            }
            Operation::Fee(m) => {
                self.caller.ensure_admin()?;
                let id = self.resolve(&m.label)?;
                self.ledger.apply_fee(id, m.amount_minor, &m.description)?;
            }
            Operation::Interest(m) => {
                self.caller.ensure_admin()?;
                let id = self.resolve(&m.label)?;
                self.ledger.post_interest(id, m.amount_minor, &m.description)?;
            }
            Operation::Freeze(label) => {
                self.caller.ensure_admin()?;
                self.ledger.freeze(self.resolve(&label)?)?;
            }
            Operation::Unfreeze(label) => {
                self.caller.ensure_admin()?;
                self.ledger.unfreeze(self.resolve(&label)?)?;
            }
            Operation::Close(label) => {
                let id = self.owned(&label)?;
                self.ledger.close(id)?;
            }
        }
        Ok(())
    }

    fn resolve(&self, label: &str) -> Result<AccountId> {
        self.account_id(label)
            .ok_or_else(|| LedgerError::account_not_found(label))
    }

    /// Resolves `label` and checks the caller may operate on it.
    fn owned(&self, label: &str) -> Result<AccountId> {
        let id = self.resolve(label)?;
        let account = self.ledger.get_account(id)?;
        self.caller.ensure_owner(&account)?;
        Ok(id)
    }

    /// Writes final account states to CSV, sorted by label.
    pub fn write_accounts<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["account", "number", "class", "status", "balance", "available"])?;

        for (label, id) in &self.labels {
            let account = self.ledger.get_account(*id)?;
            csv_writer.write_record([
                label.clone(),
                account.masked_number(),
                account.class().to_string(),
                account.status().to_string(),
                account.balance().to_string(),
                account.available_balance().to_string(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Writes every account's transaction history to CSV, grouped by label
    /// and in append order within an account.
    pub fn write_history<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "account",
            "kind",
            "direction",
            "amount",
            "balance_before",
            "balance_after",
            "status",
            "channel",
            "correlation",
            "description",
        ])?;

        for (label, id) in &self.labels {
            for record in self.ledger.journal().all_for_account(*id)? {
                csv_writer.write_record([
                    label.clone(),
                    record.kind.to_string(),
                    record.direction.to_string(),
                    record.amount.to_string(),
                    record.balance_before.to_string(),
                    record.balance_after.to_string(),
                    record.status.to_string(),
                    record.channel.to_string(),
                    record
                        .correlation_id
                        .map(|c| c.to_string())
                        .unwrap_or_default(),
                    record.description,
                ])?;
            }
        }

        csv_writer.flush()?;
        Ok(())
    }
}
