//! Error types for the ledger core.

use crate::transaction::{TransactionId, TransferSummary};
use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur during ledger operation.
///
/// Every failure carries a specific kind so the presentation layer can
/// report it accurately.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Account or transaction absent
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Non-positive amount, malformed reference or similar
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transfer source and destination are the same account
    #[error("Source and destination account are the same: {0}")]
    SameAccount(String),

    /// Transfer source account does not exist
    #[error("Source account not found: {0}")]
    SourceNotFound(String),

    /// Transfer destination account does not exist
    #[error("Destination account not found: {0}")]
    DestinationNotFound(String),

    /// Available balance does not cover the amount
    #[error("Insufficient funds in account {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        account: String,
        available: String,
        requested: String,
    },

    /// The operation would push today's total over the configured limit
    #[error("Daily {operation} limit exceeded for account {account}: limit {limit}, used {used}, requested {requested}")]
    DailyLimitExceeded {
        account: String,
        operation: &'static str,
        limit: String,
        used: String,
        requested: String,
    },

    /// Account is frozen or closed
    #[error("Account {account} is {status}")]
    AccountInactive { account: String, status: String },

    /// Stored version changed since the account was loaded
    #[error("Concurrent modification of account {0}")]
    Conflict(String),

    /// Durable store did not answer in time
    #[error("Storage timeout during {0}")]
    StorageTimeout(String),

    /// Attempted edit of a completed transaction record
    #[error("Transaction record {0} is immutable")]
    ImmutableRecord(TransactionId),

    /// Caller-supplied transaction id collides with an existing record
    #[error("Duplicate transaction ID {0}")]
    DuplicateTransactionId(TransactionId),

    /// Second leg of a transfer failed and the first leg was compensated
    #[error("Transfer {} reversed: {reason}", .summary.correlation_id)]
    PartialTransferReversed {
        summary: Box<TransferSummary>,
        reason: String,
    },

    /// A compensating action failed; manual reconciliation required
    #[error("Reconciliation required for {reference}: {reason}")]
    ReconciliationRequired { reference: String, reason: String },

    /// Caller lacks the privilege for the operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Failed to open or read a batch file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing error
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),
}

impl LedgerError {
    /// Returns `true` for transient errors that are safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict(_) | LedgerError::StorageTimeout(_)
        )
    }

    /// Returns `true` for invariant violations that indicate a bug or
    /// require manual intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::ImmutableRecord(_) | LedgerError::ReconciliationRequired { .. }
        )
    }

    pub(crate) fn account_not_found(id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity: "account",
            id: id.to_string(),
        }
    }

    pub(crate) fn transaction_not_found(id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity: "transaction",
            id: id.to_string(),
        }
    }
}
