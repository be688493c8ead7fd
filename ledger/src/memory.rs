//! In-memory ledger store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::debug;

use bankcore_common::{AccountId, BankError, Currency, OwnerId, Result};

use crate::account::Account;
use crate::journal::{EntryStatus, EntryType, LedgerEntry, TransferLegs};
use crate::store::{lock_order, LedgerStore};

/// Fault injection switches for a [`MemoryStore`].
#[derive(Debug, Default)]
pub struct StoreFaults {
    /// Delay before every operation, in milliseconds.
    latency_ms: AtomicU64,
    /// Reject every operation as if the connection were lost.
    unavailable: AtomicBool,
    /// Reject ledger entry appends only.
    fail_entry_appends: AtomicBool,
}

impl StoreFaults {
    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every operation fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every ledger entry write fail.
    ///
    /// Bare balance changes and transfer movements still succeed; a balance
    /// change recorded together with its entry is rejected whole.
    pub fn set_fail_entry_appends(&self, fail: bool) {
        self.fail_entry_appends.store(fail, Ordering::SeqCst);
    }

    /// Clear all faults.
    pub fn clear(&self) {
        self.latency_ms.store(0, Ordering::SeqCst);
        self.unavailable.store(false, Ordering::SeqCst);
        self.fail_entry_appends.store(false, Ordering::SeqCst);
    }

    fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Ledger store kept in process memory.
///
/// Each account lives in its own mutex cell; the read-check-write of a
/// balance update happens under that cell's lock. Entries go to one
/// append-only journal.
pub struct MemoryStore {
    /// Account cells by ID.
    accounts: DashMap<AccountId, Arc<Mutex<Account>>>,
    /// Append-only journal in commit order.
    journal: RwLock<Vec<LedgerEntry>>,
    /// Injected faults.
    faults: StoreFaults,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            journal: RwLock::new(Vec::new()),
            faults: StoreFaults::default(),
        }
    }

    /// Access fault injection switches.
    pub fn faults(&self) -> &StoreFaults {
        &self.faults
    }

    /// Sum of all balances.
    pub fn total_balance(&self) -> Decimal {
        self.accounts.iter().map(|cell| cell.lock().balance).sum()
    }

    /// Number of journal entries.
    pub fn entry_count(&self) -> usize {
        self.journal.read().len()
    }

    /// Wait out injected latency, then check availability.
    ///
    /// Runs before any state is touched, so a caller dropping the future here
    /// cancels with no effect.
    async fn enter(&self, operation: &'static str) -> Result<()> {
        if let Some(latency) = self.faults.latency() {
            tokio::time::sleep(latency).await;
        }
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(BankError::Storage(format!(
                "memory store unavailable during {operation}"
            )));
        }
        Ok(())
    }

    fn check_journal_writable(&self) -> Result<()> {
        if self.faults.fail_entry_appends.load(Ordering::SeqCst) {
            return Err(BankError::Storage("journal write rejected".to_string()));
        }
        Ok(())
    }

    /// Clone the cell handle so the map shard lock is released before locking.
    fn cell(&self, id: AccountId) -> Result<Arc<Mutex<Account>>> {
        self.accounts
            .get(&id)
            .map(|cell| Arc::clone(cell.value()))
            .ok_or(BankError::AccountNotFound(id))
    }

    fn move_funds(&self, from: AccountId, to: AccountId, amount: Decimal) -> Result<()> {
        let (first, second) = lock_order(from, to);
        let first_cell = self.cell(first)?;
        let second_cell = self.cell(second)?;

        let mut first_guard = first_cell.lock();
        let mut second_guard = second_cell.lock();

        let (source, destination) = if first == from {
            (&mut *first_guard, &mut *second_guard)
        } else {
            (&mut *second_guard, &mut *first_guard)
        };

        source.apply_delta(-amount)?;
        destination.balance += amount;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_account(&self, owner_id: OwnerId, currency: Currency) -> Result<Account> {
        self.enter("create_account").await?;

        let account = Account::open(owner_id, currency);
        self.accounts
            .insert(account.id, Arc::new(Mutex::new(account.clone())));

        debug!(account_id = %account.id, owner_id = %owner_id, "Account stored");
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.enter("get_account").await?;
        let cell = self.cell(id)?;
        let account = cell.lock().clone();
        Ok(account)
    }

    async fn accounts_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Account>> {
        self.enter("accounts_by_owner").await?;

        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .map(|cell| cell.lock().clone())
            .filter(|account| account.is_owned_by(owner_id))
            .collect();
        accounts.sort_by_key(|account| account.id);
        Ok(accounts)
    }

    async fn adjust_balance(&self, id: AccountId, delta: Decimal) -> Result<Decimal> {
        self.enter("adjust_balance").await?;
        let cell = self.cell(id)?;
        let balance = cell.lock().apply_delta(delta)?;
        Ok(balance)
    }

    async fn adjust_balance_with_entry(
        &self,
        id: AccountId,
        delta: Decimal,
    ) -> Result<(Decimal, LedgerEntry)> {
        if delta.is_zero() {
            return Err(BankError::InvalidAmount);
        }

        self.enter("adjust_balance_with_entry").await?;
        let cell = self.cell(id)?;

        // The entry is pushed before the cell unlocks, so no reader sees the
        // new balance without it.
        let mut account = cell.lock();
        self.check_journal_writable()?;
        let balance = account.apply_delta(delta)?;
        let entry = LedgerEntry::for_delta(id, delta);
        self.journal.write().push(entry.clone());

        Ok((balance, entry))
    }

    async fn transfer_atomic(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<()> {
        if from == to {
            return Err(BankError::SameAccount(from));
        }
        if amount <= Decimal::ZERO {
            return Err(BankError::NonPositiveAmount(amount));
        }

        self.enter("transfer_atomic").await?;
        self.move_funds(from, to, amount)
    }

    async fn append_entry(
        &self,
        account_id: AccountId,
        amount: Decimal,
        entry_type: EntryType,
        status: EntryStatus,
    ) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(BankError::NonPositiveAmount(amount));
        }

        self.enter("append_entry").await?;
        self.check_journal_writable()?;
        if !self.accounts.contains_key(&account_id) {
            return Err(BankError::AccountNotFound(account_id));
        }

        let entry = LedgerEntry::new(account_id, amount, entry_type, status);
        self.journal.write().push(entry.clone());
        Ok(entry)
    }

    async fn append_transfer_legs(&self, legs: TransferLegs) -> Result<[LedgerEntry; 2]> {
        debug_assert!(legs.is_balanced());
        self.enter("append_transfer_legs").await?;
        self.check_journal_writable()?;
        for account_id in legs.accounts() {
            if !self.accounts.contains_key(&account_id) {
                return Err(BankError::AccountNotFound(account_id));
            }
        }

        let entries = legs.into_entries();
        self.journal.write().extend(entries.iter().cloned());
        Ok(entries)
    }

    async fn entries_by_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        self.enter("entries_by_account").await?;

        let journal = self.journal.read();
        Ok(journal
            .iter()
            .rev()
            .filter(|entry| entry.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn entries_by_owner(&self, owner_id: OwnerId) -> Result<Vec<LedgerEntry>> {
        self.enter("entries_by_owner").await?;

        let owned: HashSet<AccountId> = self
            .accounts
            .iter()
            .filter(|cell| cell.lock().is_owned_by(owner_id))
            .map(|cell| *cell.key())
            .collect();

        let journal = self.journal.read();
        Ok(journal
            .iter()
            .rev()
            .filter(|entry| owned.contains(&entry.account_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn funded(store: &MemoryStore, owner: i64, balance: Decimal) -> Account {
        let account = store
            .create_account(OwnerId::new(owner), Currency::Rub)
            .await
            .unwrap();
        if balance > Decimal::ZERO {
            store.adjust_balance(account.id, balance).await.unwrap();
        }
        store.get_account(account.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        let account = funded(&store, 1, Decimal::ZERO).await;

        assert_eq!(account.balance, Decimal::ZERO);
        assert_eq!(store.get_account(account.id).await.unwrap(), account);

        let missing = AccountId::new();
        assert_eq!(
            store.get_account(missing).await,
            Err(BankError::AccountNotFound(missing))
        );
    }

    #[tokio::test]
    async fn test_adjust_balance_guard_is_atomic() {
        let store = MemoryStore::new();
        let account = funded(&store, 1, dec!(30)).await;

        let err = store.adjust_balance(account.id, dec!(-50)).await.unwrap_err();
        assert!(matches!(err, BankError::InsufficientFunds { .. }));
        assert_eq!(store.get_account(account.id).await.unwrap().balance, dec!(30));

        assert_eq!(store.adjust_balance(account.id, dec!(-30)).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_recorded_adjustment_writes_entry_under_same_lock() {
        let store = MemoryStore::new();
        let account = funded(&store, 1, dec!(30)).await;

        let (balance, entry) = store
            .adjust_balance_with_entry(account.id, dec!(-12.25))
            .await
            .unwrap();
        assert_eq!(balance, dec!(17.75));
        assert_eq!(entry.entry_type, EntryType::Withdrawal);
        assert_eq!(entry.amount, dec!(12.25));
        assert_eq!(store.entries_by_account(account.id).await.unwrap(), vec![entry]);

        let err = store
            .adjust_balance_with_entry(account.id, dec!(-50))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::InsufficientFunds { .. }));
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_recorded_adjustment_rolls_back_when_journal_rejects() {
        let store = MemoryStore::new();
        let account = funded(&store, 1, dec!(30)).await;
        store.faults().set_fail_entry_appends(true);

        let err = store
            .adjust_balance_with_entry(account.id, dec!(25))
            .await
            .unwrap_err();
        assert!(err.is_storage_fault());
        assert_eq!(store.get_account(account.id).await.unwrap().balance, dec!(30));
        assert_eq!(store.entry_count(), 0);

        let missing = AccountId::new();
        store.faults().clear();
        assert_eq!(
            store.adjust_balance_with_entry(missing, dec!(1)).await,
            Err(BankError::AccountNotFound(missing))
        );
        assert_eq!(
            store.adjust_balance_with_entry(account.id, Decimal::ZERO).await,
            Err(BankError::InvalidAmount)
        );
    }

    #[tokio::test]
    async fn test_transfer_atomic_moves_funds() {
        let store = MemoryStore::new();
        let a = funded(&store, 1, dec!(500)).await;
        let b = funded(&store, 2, Decimal::ZERO).await;

        store.transfer_atomic(a.id, b.id, dec!(500)).await.unwrap();

        assert_eq!(store.get_account(a.id).await.unwrap().balance, dec!(0));
        assert_eq!(store.get_account(b.id).await.unwrap().balance, dec!(500));
    }

    #[tokio::test]
    async fn test_transfer_atomic_insufficient_leaves_both_untouched() {
        let store = MemoryStore::new();
        let a = funded(&store, 1, dec!(100)).await;
        let b = funded(&store, 2, dec!(7)).await;

        let err = store.transfer_atomic(a.id, b.id, dec!(150)).await.unwrap_err();
        assert_eq!(
            err,
            BankError::InsufficientFunds {
                account_id: a.id,
                requested: dec!(150),
            }
        );
        assert_eq!(store.get_account(a.id).await.unwrap().balance, dec!(100));
        assert_eq!(store.get_account(b.id).await.unwrap().balance, dec!(7));
    }

    #[tokio::test]
    async fn test_transfer_atomic_unknown_destination() {
        let store = MemoryStore::new();
        let a = funded(&store, 1, dec!(100)).await;
        let missing = AccountId::new();

        let err = store.transfer_atomic(a.id, missing, dec!(10)).await.unwrap_err();
        assert_eq!(err, BankError::AccountNotFound(missing));
        assert_eq!(store.get_account(a.id).await.unwrap().balance, dec!(100));
    }

    #[tokio::test]
    async fn test_transfer_legs_appended_together() {
        let store = MemoryStore::new();
        let a = funded(&store, 1, Decimal::ZERO).await;
        let b = funded(&store, 1, Decimal::ZERO).await;

        let entries = store
            .append_transfer_legs(TransferLegs::new(a.id, b.id, dec!(5)))
            .await
            .unwrap();
        assert_eq!(entries[0].account_id, a.id);
        assert_eq!(entries[1].account_id, b.id);

        store.faults().set_fail_entry_appends(true);
        assert!(store
            .append_transfer_legs(TransferLegs::new(a.id, b.id, dec!(5)))
            .await
            .is_err());
        assert_eq!(store.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_entries_newest_first_and_by_owner() {
        let store = MemoryStore::new();
        let a = funded(&store, 1, Decimal::ZERO).await;
        let b = funded(&store, 2, Decimal::ZERO).await;

        store
            .append_entry(a.id, dec!(1), EntryType::Deposit, EntryStatus::Completed)
            .await
            .unwrap();
        store
            .append_entry(b.id, dec!(2), EntryType::Deposit, EntryStatus::Completed)
            .await
            .unwrap();
        store
            .append_entry(a.id, dec!(3), EntryType::Withdrawal, EntryStatus::Completed)
            .await
            .unwrap();

        let entries = store.entries_by_account(a.id).await.unwrap();
        let amounts: Vec<Decimal> = entries.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![dec!(3), dec!(1)]);

        let owned = store.entries_by_owner(OwnerId::new(2)).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].account_id, b.id);
    }

    #[tokio::test]
    async fn test_append_entry_rejects_non_positive_amount() {
        let store = MemoryStore::new();
        let a = funded(&store, 1, Decimal::ZERO).await;

        let err = store
            .append_entry(a.id, dec!(-1), EntryType::Deposit, EntryStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(err, BankError::NonPositiveAmount(dec!(-1)));
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.faults().set_unavailable(true);

        let err = store
            .create_account(OwnerId::new(1), Currency::Rub)
            .await
            .unwrap_err();
        assert!(err.is_storage_fault());

        store.faults().clear();
        assert!(store.create_account(OwnerId::new(1), Currency::Rub).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_transfers_do_not_deadlock() {
        let store = Arc::new(MemoryStore::new());
        let a = funded(&store, 1, dec!(1000)).await;
        let b = funded(&store, 2, dec!(1000)).await;

        let mut handles = Vec::new();
        for i in 0..200 {
            let store = Arc::clone(&store);
            let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
            handles.push(tokio::spawn(async move {
                store.transfer_atomic(from, to, dec!(3)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.total_balance(), dec!(2000));
        assert_eq!(store.get_account(a.id).await.unwrap().balance, dec!(1000));
    }
}
