//! Outbound ledger events.
//!
//! The core only emits events; delivering email or chat messages is the
//! job of whoever implements the sink.

use crate::account::AccountId;
use crate::transaction::CorrelationId;
use log::info;
use parking_lot::Mutex;

/// Something a downstream notifier may care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    TransferCompleted {
        correlation_id: CorrelationId,
        source: AccountId,
        destination: AccountId,
        amount_minor: i64,
    },
    TransferReversed {
        correlation_id: CorrelationId,
        source: AccountId,
        destination: AccountId,
        amount_minor: i64,
        reason: String,
    },
}

/// Receiver of ledger events.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: LedgerEvent);
}

/// Writes events to the log at `info` level.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish(&self, event: LedgerEvent) {
        match event {
            LedgerEvent::TransferCompleted {
                correlation_id,
                source,
                destination,
                amount_minor,
            } => info!(
                "Transfer {} completed: {} -> {} ({} minor units)",
                correlation_id, source, destination, amount_minor
            ),
            LedgerEvent::TransferReversed {
                correlation_id,
                source,
                destination,
                amount_minor,
                reason,
            } => info!(
                "Transfer {} reversed: {} -> {} ({} minor units): {}",
                correlation_id, source, destination, amount_minor, reason
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LedgerEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, event: LedgerEvent) {
        self.events.lock().push(event);
    }
}
