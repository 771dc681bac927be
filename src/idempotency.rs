//! Idempotency-key bookkeeping.
//!
//! A key remembers the request it was first used with. Replaying the same
//! request returns the stored result; reusing the key for a different
//! request is rejected.

use crate::account::AccountId;
use crate::error::{LedgerError, Result};
use crate::money::Money;
use crate::transaction::IdempotencyKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// What a request was, for comparing replays against the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    operation: &'static str,
    accounts: Vec<AccountId>,
    amount: Money,
}

impl RequestFingerprint {
    pub fn new(operation: &'static str, accounts: &[AccountId], amount: Money) -> Self {
        RequestFingerprint {
            operation,
            accounts: accounts.to_vec(),
            amount,
        }
    }
}

/// What a caller holds after claiming a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim<T> {
    /// The key is now reserved for this request; finish with
    /// [`IdempotencyCache::complete`] or [`IdempotencyCache::release`].
    Fresh,
    /// The same request already ran; here is its result.
    Replay(T),
}

enum Slot<T> {
    InFlight(RequestFingerprint),
    Done(RequestFingerprint, T),
}

impl<T> Slot<T> {
    fn fingerprint(&self) -> &RequestFingerprint {
        match self {
            Slot::InFlight(fp) | Slot::Done(fp, _) => fp,
        }
    }
}

/// Results keyed by idempotency key.
///
/// Claiming is atomic per key, so two requests sharing a key can never both
/// run, even when they touch different accounts.
pub struct IdempotencyCache<T> {
    entries: DashMap<IdempotencyKey, Slot<T>>,
}

impl<T: Clone> IdempotencyCache<T> {
    pub fn new() -> Self {
        IdempotencyCache {
            entries: DashMap::new(),
        }
    }

    /// Reserves `key` for the request described by `fingerprint`.
    ///
    /// Fails with `InvalidInput` if the key belongs to a different request
    /// and with `Conflict` if the same request is still running.
    pub fn claim(&self, key: &IdempotencyKey, fingerprint: &RequestFingerprint) -> Result<Claim<T>> {
        match self.entries.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Slot::InFlight(fingerprint.clone()));
                Ok(Claim::Fresh)
            }
            Entry::Occupied(slot) => {
                if slot.get().fingerprint() != fingerprint {
                    return Err(LedgerError::InvalidInput(format!(
                        "idempotency key {key} was already used for a different request"
                    )));
                }
                match slot.get() {
                    Slot::Done(_, value) => Ok(Claim::Replay(value.clone())),
                    Slot::InFlight(_) => Err(LedgerError::Conflict(format!(
                        "request with idempotency key {key} is still in progress"
                    ))),
                }
            }
        }
    }

    /// Stores the result of a claimed request.
    pub fn complete(&self, key: IdempotencyKey, fingerprint: RequestFingerprint, value: T) {
        self.entries.insert(key, Slot::Done(fingerprint, value));
    }

    /// Frees a claimed key whose request did not produce a result to keep.
    pub fn release(&self, key: &IdempotencyKey) {
        self.entries
            .remove_if(key, |_, slot| matches!(slot, Slot::InFlight(_)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for IdempotencyCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
