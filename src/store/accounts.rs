use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use super::{AccountStore, StoreError};
use crate::Amount;
use crate::journal::Journal;
use crate::model::{Account, AccountNumber, MobileNumber};

/// Sharded concurrent account table, optionally backed by a CSV journal.
///
/// Each compare-and-swap takes only the shard lock of the account it touches,
/// so transfers over disjoint accounts never contend. With a journal, the new
/// account row is appended before the in-memory value changes; a failed append
/// leaves the balance untouched.
pub struct Accounts {
    accounts: DashMap<AccountNumber, Account>,
    /// mobile number -> account number
    mobiles: DashMap<MobileNumber, AccountNumber>,
    journal: Option<Journal<Account>>,
}

impl Accounts {
    /// A volatile store, for tests and demo runs.
    pub fn in_memory() -> Self {
        Self {
            accounts: DashMap::new(),
            mobiles: DashMap::new(),
            journal: None,
        }
    }

    /// Open a durable store, replaying the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let (journal, rows) = Journal::<Account>::open(path)?;
        let mut store = Self::in_memory();
        let replayed = rows.len();
        for account in rows {
            store.restore(account);
        }
        info!(
            path = %journal.path().display(),
            rows = replayed,
            accounts = store.accounts.len(),
            "account store restored"
        );
        store.journal = Some(journal);
        Ok(store)
    }

    /// Last row per account wins.
    fn restore(&self, account: Account) {
        self.mobiles
            .insert(account.mobile_number.clone(), account.account_number.clone());
        self.accounts.insert(account.account_number.clone(), account);
    }

    fn record(&self, account: &Account) -> Result<(), StoreError> {
        if let Some(journal) = &self.journal {
            journal.append(account)?;
        }
        Ok(())
    }
}

impl Default for Accounts {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl AccountStore for Accounts {
    async fn get(&self, account_number: &str) -> Result<Account, StoreError> {
        self.accounts
            .get(account_number)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(account_number.to_string()))
    }

    async fn compare_and_swap_balance(
        &self,
        account_number: &str,
        expected: Amount,
        new: Amount,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .accounts
            .get_mut(account_number)
            .ok_or_else(|| StoreError::NotFound(account_number.to_string()))?;

        if entry.balance != expected {
            return Err(StoreError::Conflict {
                account: account_number.to_string(),
                expected,
                actual: entry.balance,
            });
        }

        entry.balance = new;
        if let Err(e) = self.record(&entry) {
            entry.balance = expected;
            return Err(e);
        }
        Ok(())
    }

    async fn find_by_mobile(&self, mobile_number: &str) -> Result<Account, StoreError> {
        // clone out so the index guard is released before touching `accounts`
        let account_number = self
            .mobiles
            .get(mobile_number)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("mobile number {mobile_number}")))?;
        self.get(&account_number).await
    }

    async fn find_by_owner(&self, owner_name: &str) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .accounts
            .iter()
            .filter(|entry| entry.owner_name == owner_name)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn insert(&self, account: Account) -> Result<(), StoreError> {
        // lock order: mobiles before accounts, never the reverse
        let mobile_slot = match self.mobiles.entry(account.mobile_number.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::AlreadyExists(format!(
                    "mobile number {}",
                    account.mobile_number
                )));
            }
            Entry::Vacant(slot) => slot,
        };
        let account_slot = match self.accounts.entry(account.account_number.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::AlreadyExists(format!(
                    "account number {}",
                    account.account_number
                )));
            }
            Entry::Vacant(slot) => slot,
        };

        self.record(&account)?;
        mobile_slot.insert(account.account_number.clone());
        account_slot.insert(account);
        Ok(())
    }

    async fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .accounts
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn account(number: &str, mobile: &str, balance: u64) -> Account {
        Account {
            account_number: number.to_string(),
            owner_name: format!("owner-{number}"),
            branch: "Main".to_string(),
            mobile_number: mobile.to_string(),
            pin_hash: "hash".to_string(),
            balance: Amount::new(balance),
        }
    }

    #[tokio::test]
    async fn get_returns_inserted_account() {
        let store = Accounts::in_memory();
        store.insert(account("A1", "9000", 500)).await.unwrap();

        let found = store.get("A1").await.unwrap();
        assert_eq!(found.balance, Amount::new(500));
        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_account_or_mobile() {
        let store = Accounts::in_memory();
        store.insert(account("A1", "9000", 0)).await.unwrap();

        assert!(matches!(
            store.insert(account("A1", "9001", 0)).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.insert(account("A2", "9000", 0)).await,
            Err(StoreError::AlreadyExists(_))
        ));

        // the failed insert of A1/9001 must not leave a dangling index entry
        store.insert(account("A3", "9001", 0)).await.unwrap();
        assert_eq!(store.accounts().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn compare_and_swap_applies_only_on_expected_balance() {
        let store = Accounts::in_memory();
        store.insert(account("A1", "9000", 100)).await.unwrap();

        store
            .compare_and_swap_balance("A1", Amount::new(100), Amount::new(70))
            .await
            .unwrap();
        assert_eq!(store.get("A1").await.unwrap().balance, Amount::new(70));

        let stale = store
            .compare_and_swap_balance("A1", Amount::new(100), Amount::new(0))
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::Conflict { actual, .. }) if actual == Amount::new(70)
        ));
        assert_eq!(store.get("A1").await.unwrap().balance, Amount::new(70));

        assert!(matches!(
            store
                .compare_and_swap_balance("nope", Amount::ZERO, Amount::ZERO)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn find_by_mobile_and_owner() {
        let store = Accounts::in_memory();
        store.insert(account("A1", "9000", 0)).await.unwrap();
        store.insert(account("B2", "9111", 0)).await.unwrap();

        assert_eq!(
            store.find_by_mobile("9111").await.unwrap().account_number,
            "B2"
        );
        assert!(store.find_by_mobile("1234").await.is_err());

        let owned = store.find_by_owner("owner-A1").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].account_number, "A1");
        assert!(store.find_by_owner("nobody").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_swaps_from_same_snapshot_have_one_winner() {
        let store = Arc::new(Accounts::in_memory());
        store.insert(account("A1", "9000", 100)).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .compare_and_swap_balance("A1", Amount::new(100), Amount::new(i))
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn durable_store_replays_latest_balances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.csv");

        {
            let store = Accounts::open(&path).unwrap();
            store.insert(account("A1", "9000", 50_000)).await.unwrap();
            store.insert(account("B2", "9111", 50_000)).await.unwrap();
            store
                .compare_and_swap_balance("A1", Amount::new(50_000), Amount::new(49_000))
                .await
                .unwrap();
            store
                .compare_and_swap_balance("B2", Amount::new(50_000), Amount::new(51_000))
                .await
                .unwrap();
        }

        let store = Accounts::open(&path).unwrap();
        assert_eq!(store.get("A1").await.unwrap().balance, Amount::new(49_000));
        assert_eq!(store.get("B2").await.unwrap().balance, Amount::new(51_000));
        assert_eq!(
            store.find_by_mobile("9111").await.unwrap().account_number,
            "B2"
        );
        assert_eq!(store.total_balance().await.unwrap(), Amount::new(100_000));
    }
}
