//! Ledger configuration.

use crate::account::DailyLimits;
use std::time::Duration;

/// Tunables for the ledger engine.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Retries after the first attempt for `Conflict`/`StorageTimeout`.
    pub max_retries: u32,
    /// Initial backoff; doubled on each retry.
    pub retry_backoff: Duration,
    /// Limits given to accounts opened without explicit ones.
    pub default_limits: DailyLimits,
    /// UTC offset in seconds for accounts opened without one.
    pub default_utc_offset_secs: i32,
    /// Attempts at drawing an unused account number before giving up.
    pub account_number_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            max_retries: 3,
            retry_backoff: Duration::from_millis(5),
            default_limits: DailyLimits::default(),
            default_utc_offset_secs: 0,
            account_number_attempts: 16,
        }
    }
}

impl LedgerConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.retry_backoff.saturating_mul(factor)
    }
}
