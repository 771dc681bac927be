//! Two-leg transfers.
//!
//! Both account locks are taken in ascending id order, so opposite-direction
//! transfers between the same pair cannot deadlock. The debit leg goes
//! first; if the credit leg then fails, the debit is compensated by a new
//! reversal record rather than by editing history.

use crate::account::{Account, AccountId};
use crate::error::{LedgerError, Result};
use crate::idempotency::{Claim, IdempotencyCache, RequestFingerprint};
use crate::ledger::{positive_amount, Ledger, LimitKind, Posting};
use crate::money::Money;
use crate::notify::{LedgerEvent, NotificationSink};
use crate::transaction::{
    Channel, CorrelationId, Direction, IdempotencyKey, TransactionRecord, TransferOutcome,
    TransferSummary, TxKind, TxStatus,
};
use log::{debug, error};
use std::sync::Arc;

/// Executes transfers on top of a [`Ledger`].
pub struct TransferOrchestrator {
    ledger: Arc<Ledger>,
    sink: Option<Arc<dyn NotificationSink>>,
    completed: IdempotencyCache<TransferSummary>,
}

impl TransferOrchestrator {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        TransferOrchestrator {
            ledger,
            sink: None,
            completed: IdempotencyCache::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Moves `amount_minor` from `source` to `destination`.
    ///
    /// Returns `PartialTransferReversed` if the credit leg failed and the
    /// debit was compensated, `ReconciliationRequired` if the compensation
    /// itself failed.
    pub fn execute(
        &self,
        source: AccountId,
        destination: AccountId,
        amount_minor: i64,
        description: &str,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<TransferSummary> {
        if source == destination {
            return Err(LedgerError::SameAccount(source.to_string()));
        }
        let amount = positive_amount(amount_minor)?;
        let fingerprint = RequestFingerprint::new("transfer", &[source, destination], amount);

        // Both sides must exist before they get a lock.
        self.load(source, destination)?;
        let (first, second) = if source < destination {
            (source, destination)
        } else {
            (destination, source)
        };
        let first_lock = self.ledger.locks.handle(first);
        let second_lock = self.ledger.locks.handle(second);
        let _first_guard = first_lock.lock();
        let _second_guard = second_lock.lock();

        let key = match idempotency_key {
            Some(key) => key,
            None => return self.execute_locked(source, destination, amount, description, None),
        };
        if let Claim::Replay(previous) = self.completed.claim(&key, &fingerprint)? {
            debug!("Replayed transfer for idempotency key {}", key);
            return Ok(previous);
        }
        match self.execute_locked(source, destination, amount, description, Some(key.clone())) {
            Ok(summary) => {
                self.completed.complete(key, fingerprint, summary.clone());
                Ok(summary)
            }
            // reversed transfers may be retried under the same key
            Err(err) => {
                self.completed.release(&key);
                Err(err)
            }
        }
    }

    fn load(&self, source: AccountId, destination: AccountId) -> Result<(Account, Account)> {
        let src = self.ledger.store.get_account(source).map_err(|e| match e {
            LedgerError::NotFound { .. } => LedgerError::SourceNotFound(source.to_string()),
            other => other,
        })?;
        let dst = self.ledger.store.get_account(destination).map_err(|e| match e {
            LedgerError::NotFound { .. } => LedgerError::DestinationNotFound(destination.to_string()),
            other => other,
        })?;
        Ok((src, dst))
    }

    /// Validates and runs both legs. The caller holds both locks.
    fn execute_locked(
        &self,
        source: AccountId,
        destination: AccountId,
        amount: Money,
        description: &str,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<TransferSummary> {
        let (src, dst) = self.load(source, destination)?;
        src.ensure_active()?;
        dst.ensure_active()?;
        src.ensure_covers(amount)?;
        self.ledger.check_daily_limit(&src, LimitKind::Transfer, amount)?;

        let correlation = CorrelationId::new();
        let (debit_posting, credit_posting) =
            self.legs(&src, &dst, amount, description, correlation, idempotency_key);

        // Nothing has moved if the debit fails.
        let debit = self.ledger.post_locked(&debit_posting)?;

        match self.ledger.post_locked(&credit_posting) {
            Ok(credit) => {
                let summary = TransferSummary {
                    correlation_id: correlation,
                    debit: debit.summary(),
                    credit: credit.summary(),
                    failed_credit: None,
                    outcome: TransferOutcome::Completed,
                };
                debug!(
                    "Transfer {} of {} from {} to {} completed",
                    correlation,
                    amount,
                    src.masked_number(),
                    dst.masked_number()
                );
                self.publish(LedgerEvent::TransferCompleted {
                    correlation_id: correlation,
                    source,
                    destination,
                    amount_minor: summary.debit.amount_minor,
                });
                Ok(summary)
            }
            Err(cause) => self.compensate(&credit_posting, debit, correlation, cause),
        }
    }

    fn legs(
        &self,
        src: &Account,
        dst: &Account,
        amount: Money,
        description: &str,
        correlation: CorrelationId,
        idempotency_key: Option<IdempotencyKey>,
    ) -> (Posting, Posting) {
        let (debit_text, credit_text) = if description.trim().is_empty() {
            (
                format!("Transfer to {}", dst.masked_number()),
                format!("Transfer from {}", src.masked_number()),
            )
        } else {
            (description.to_string(), description.to_string())
        };

        let mut debit = Posting::new(
            src.id(),
            TxKind::Transfer,
            Direction::Debit,
            amount,
            debit_text,
            Channel::Online,
        );
        debit.counterparty = Some(dst.id());
        debit.correlation = Some(correlation);
        debit.idempotency_key = idempotency_key.clone();

        let mut credit = Posting::new(
            dst.id(),
            TxKind::Transfer,
            Direction::Credit,
            amount,
            credit_text,
            Channel::Online,
        );
        credit.counterparty = Some(src.id());
        credit.correlation = Some(correlation);
        credit.idempotency_key = idempotency_key;

        (debit, credit)
    }

    /// Undoes an applied debit after its credit leg failed.
    fn compensate(
        &self,
        credit_posting: &Posting,
        debit: TransactionRecord,
        correlation: CorrelationId,
        cause: LedgerError,
    ) -> Result<TransferSummary> {
        let source = debit.account_id;
        let destination = credit_posting.account;
        error!(
            "Transfer {}: credit leg to {} failed after debit {} was applied: {}",
            correlation, destination, debit.id, cause
        );

        let failed_credit = match self.failed_leg(credit_posting, correlation) {
            Ok(record) => Some(record.summary()),
            Err(err) => {
                error!("Transfer {}: could not log failed credit leg: {}", correlation, err);
                None
            }
        };

        let debit_summary = debit.summary();
        let mut reversal = Posting::new(
            source,
            TxKind::Reversal,
            Direction::Credit,
            debit.amount,
            format!("Reversal of transfer {correlation}"),
            Channel::System,
        );
        reversal.counterparty = Some(destination);
        reversal.correlation = Some(correlation);
        reversal.reverses = Some(debit.id);
        reversal.allow_frozen = true;

        match self.ledger.post_locked(&reversal) {
            Ok(reversal) => {
                let reason = cause.to_string();
                error!(
                    "Transfer {} reversed: {} returned to {} by {}",
                    correlation, debit.amount, source, reversal.id
                );
                self.publish(LedgerEvent::TransferReversed {
                    correlation_id: correlation,
                    source,
                    destination,
                    amount_minor: debit_summary.amount_minor,
                    reason: reason.clone(),
                });
                let summary = TransferSummary {
                    correlation_id: correlation,
                    debit: debit_summary,
                    credit: reversal.summary(),
                    failed_credit,
                    outcome: TransferOutcome::Reversed,
                };
                Err(LedgerError::PartialTransferReversed {
                    summary: Box::new(summary),
                    reason,
                })
            }
            Err(reversal_err) => {
                error!(
                    "Transfer {}: reversal of debit {} failed, {} is missing from {}: {}",
                    correlation, debit.id, debit.amount, source, reversal_err
                );
                Err(LedgerError::ReconciliationRequired {
                    reference: correlation.to_string(),
                    reason: format!(
                        "credit leg failed ({cause}); reversal failed ({reversal_err})"
                    ),
                })
            }
        }
    }

    /// The failed record of the credit leg. A leg that never reached the
    /// log gets one appended now.
    fn failed_leg(&self, credit: &Posting, correlation: CorrelationId) -> Result<TransactionRecord> {
        let staged = self
            .ledger
            .journal
            .find_by_correlation(correlation)?
            .into_iter()
            .find(|r| r.account_id == credit.account && r.status == TxStatus::Failed);
        match staged {
            Some(record) => Ok(record),
            None => self.ledger.record_failure(credit),
        }
    }

    fn publish(&self, event: LedgerEvent) {
        if let Some(sink) = &self.sink {
            sink.publish(event);
        }
    }
}
