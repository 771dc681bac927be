//! Account storage.
//!
//! Pure storage with existence and uniqueness guarantees; business rules
//! live in the ledger. `persist` uses optimistic versioning: the caller
//! hands back the version it loaded and the write fails with `Conflict` if
//! anyone else got there first.

use crate::account::{Account, AccountId, OwnerId};
use crate::error::{LedgerError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Durable home of account rows.
pub trait AccountStore: Send + Sync {
    fn get_account(&self, id: AccountId) -> Result<Account>;

    fn get_account_by_number(&self, number: &str) -> Result<Account>;

    /// Accounts owned by `owner`, optionally including closed ones.
    fn list_accounts(&self, owner: &OwnerId, include_closed: bool) -> Result<Vec<Account>>;

    /// Open accounts owned by `owner`.
    fn list_accounts_for_owner(&self, owner: &OwnerId) -> Result<Vec<Account>> {
        self.list_accounts(owner, false)
    }

    /// Stores a new account. Fails if the id or number is taken.
    fn insert(&self, account: Account) -> Result<Account>;

    /// Writes back a loaded account; returns the stored row with its new version.
    fn persist(&self, account: &Account) -> Result<Account>;

    fn all_accounts(&self) -> Result<Vec<Account>>;
}

/// In-memory store backed by concurrent maps.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<AccountId, Account>,
    numbers: DashMap<String, AccountId>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn get_account(&self, id: AccountId) -> Result<Account> {
        self.accounts
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| LedgerError::account_not_found(id))
    }

    fn get_account_by_number(&self, number: &str) -> Result<Account> {
        let id = self
            .numbers
            .get(number)
            .map(|id| *id)
            .ok_or_else(|| LedgerError::account_not_found(number))?;
        self.get_account(id)
    }

    fn list_accounts(&self, owner: &OwnerId, include_closed: bool) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|a| a.owner() == owner && (include_closed || !a.is_closed()))
            .map(|a| a.clone())
            .collect();
        accounts.sort_by_key(|a| a.created_at());
        Ok(accounts)
    }

    fn insert(&self, account: Account) -> Result<Account> {
        if self.accounts.contains_key(&account.id) {
            return Err(LedgerError::InvalidInput(format!(
                "account id {} already exists",
                account.id
            )));
        }
        match self.numbers.entry(account.number.clone()) {
            Entry::Occupied(_) => {
                return Err(LedgerError::InvalidInput(format!(
                    "account number {} already exists",
                    account.number
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(account.id);
            }
        }
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn persist(&self, account: &Account) -> Result<Account> {
        let mut slot = self
            .accounts
            .get_mut(&account.id)
            .ok_or_else(|| LedgerError::account_not_found(account.id))?;
        if slot.version != account.version {
            return Err(LedgerError::Conflict(account.id.to_string()));
        }
        let mut stored = account.clone();
        stored.version += 1;
        *slot = stored.clone();
        Ok(stored)
    }

    fn all_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.iter().map(|a| a.clone()).collect())
    }
}
