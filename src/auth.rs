//! Caller identity as handed over by the auth middleware.
//!
//! Nothing here authenticates anyone; the ledger trusts the context it is
//! given and only checks it against the account being touched.

use crate::account::{Account, OwnerId};
use crate::error::{LedgerError, Result};

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub owner: OwnerId,
    pub admin: bool,
}

impl Caller {
    pub fn customer(owner: impl Into<String>) -> Self {
        Caller {
            owner: OwnerId(owner.into()),
            admin: false,
        }
    }

    pub fn admin(owner: impl Into<String>) -> Self {
        Caller {
            owner: OwnerId(owner.into()),
            admin: true,
        }
    }

    /// Admins may act on any account; customers only on their own.
    pub fn ensure_owner(&self, account: &Account) -> Result<()> {
        if self.admin || account.owner() == &self.owner {
            Ok(())
        } else {
            Err(LedgerError::Unauthorized(format!(
                "{} does not own account {}",
                self.owner,
                account.masked_number()
            )))
        }
    }

    pub fn ensure_admin(&self) -> Result<()> {
        if self.admin {
            Ok(())
        } else {
            Err(LedgerError::Unauthorized(format!(
                "{} is not an administrator",
                self.owner
            )))
        }
    }
}
