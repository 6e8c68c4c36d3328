//! Account store.
//!
//! Balances are mutated exclusively through [`AccountStore::compare_and_swap_balance`],
//! an atomic conditional write that lets the transfer engine update accounts
//! optimistically without holding locks across awaits.

use async_trait::async_trait;
use thiserror::Error;

use crate::Amount;
use crate::journal::JournalError;
use crate::model::{Account, AccountNumber};

mod accounts;
pub use accounts::Accounts;

/// Error returned by account store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    NotFound(String),

    #[error(
        "balance of account {account} changed concurrently: expected {expected}, found {actual}"
    )]
    Conflict {
        account: AccountNumber,
        expected: Amount,
        actual: Amount,
    },

    #[error("{0} is already registered")]
    AlreadyExists(String),

    #[error("account store unavailable: {0}")]
    Unavailable(String),
}

impl From<JournalError> for StoreError {
    fn from(e: JournalError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Durable mapping from account number to account.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, account_number: &str) -> Result<Account, StoreError>;

    /// Set the balance to `new` only if it currently equals `expected`.
    async fn compare_and_swap_balance(
        &self,
        account_number: &str,
        expected: Amount,
        new: Amount,
    ) -> Result<(), StoreError>;

    async fn find_by_mobile(&self, mobile_number: &str) -> Result<Account, StoreError>;

    /// Every account registered under `owner_name`; names are not unique.
    async fn find_by_owner(&self, owner_name: &str) -> Result<Vec<Account>, StoreError>;

    /// Register a new account. Account and mobile numbers are unique.
    async fn insert(&self, account: Account) -> Result<(), StoreError>;

    /// Point-in-time copy of every account.
    async fn accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Sum of all balances. Only meaningful while no transfer is in flight.
    async fn total_balance(&self) -> Result<Amount, StoreError> {
        Ok(self.accounts().await?.iter().map(|a| a.balance).sum())
    }
}
