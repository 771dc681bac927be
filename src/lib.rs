//! # Bank Ledger
//!
//! The ledger and funds-transfer core of an online-banking backend:
//! accounts, an append-only transaction log, and the operations that move
//! money between them.
//!
//! ## Design Principles
//!
//! - **Fixed-point arithmetic**: 2 decimal places via `rust_decimal`
//! - **Atomic mutations**: a balance change and its record land together or not at all
//! - **Serialized writers**: per-account locks, transfers lock in ascending id order
//! - **Compensated transfers**: a failed credit leg reverses the debit
//! - **Append-only history**: completed records never change
//!
//! ## Example
//!
//! ```no_run
//! use bank_ledger::{AccountClass, Channel, Ledger, OwnerId, TransferOrchestrator};
//! use std::sync::Arc;
//!
//! let ledger = Arc::new(Ledger::in_memory());
//! let alice = ledger
//!     .open_account(OwnerId::from("alice"), AccountClass::Savings, 10_000, None)
//!     .unwrap();
//! let bob = ledger
//!     .open_account(OwnerId::from("bob"), AccountClass::Current, 0, None)
//!     .unwrap();
//!
//! ledger
//!     .apply_deposit(alice.id(), 2_500, "Salary", Channel::Online, None)
//!     .unwrap();
//! let transfers = TransferOrchestrator::new(ledger.clone());
//! transfers.execute(alice.id(), bob.id(), 5_000, "Rent", None).unwrap();
//! ```

pub mod account;
pub mod auth;
pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod journal;
pub mod ledger;
pub mod money;
pub mod notify;
pub mod store;
pub mod transaction;
pub mod transfer;

pub use account::{
    Account, AccountClass, AccountId, AccountOptions, AccountStatus, DailyLimits, OwnerId,
};
pub use auth::Caller;
pub use batch::{BatchProcessor, BatchReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use journal::{Amendment, DateRange, InMemoryTransactionLog, TransactionLog};
pub use ledger::{AdjustmentIntent, HistoryQuery, Ledger};
pub use money::Money;
pub use notify::{LedgerEvent, LogSink, NotificationSink, RecordingSink};
pub use store::{AccountStore, InMemoryAccountStore};
pub use transaction::{
    Channel, CorrelationId, Direction, IdempotencyKey, TransactionId, TransactionRecord,
    TransactionSummary, TransferOutcome, TransferSummary, TxKind, TxStatus,
};
pub use transfer::TransferOrchestrator;
