//! Bounded storage calls.
//!
//! [`TimedStore`] wraps any [`LedgerStore`] and runs every call under
//! `tokio::time::timeout`. On expiry the inner future is dropped; the
//! memory backend has not yet touched state at any of its await points, so
//! the caller sees `StorageTimeout` and nothing changed.
//!
//! Writes to a store that reports a [`LedgerStore::commit_deadline`] are not
//! cut off here. Such a store bounds its own work up to `COMMIT` and lets the
//! commit finish, since dropping it mid-flight leaves the outcome unknown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::error;

use bankcore_common::{AccountId, BankError, Currency, OwnerId, Result};
use bankcore_ledger::{
    Account, EntryStatus, EntryType, LedgerEntry, LedgerStore, TransferLegs,
};

/// A ledger store whose calls are bounded by a deadline.
pub struct TimedStore {
    inner: Arc<dyn LedgerStore>,
    limit: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn LedgerStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.limit, call).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    operation,
                    backend = self.inner.backend(),
                    limit_ms = self.limit.as_millis() as u64,
                    "Storage call timed out"
                );
                Err(BankError::StorageTimeout(format!(
                    "{operation} exceeded {}ms",
                    self.limit.as_millis()
                )))
            }
        }
    }

    async fn committing<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        if self.inner.commit_deadline().is_some() {
            call.await
        } else {
            self.bounded(operation, call).await
        }
    }
}

#[async_trait]
impl LedgerStore for TimedStore {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn commit_deadline(&self) -> Option<Duration> {
        self.inner.commit_deadline()
    }

    async fn create_account(&self, owner_id: OwnerId, currency: Currency) -> Result<Account> {
        self.committing("create_account", self.inner.create_account(owner_id, currency))
            .await
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.bounded("get_account", self.inner.get_account(id)).await
    }

    async fn accounts_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Account>> {
        self.bounded("accounts_by_owner", self.inner.accounts_by_owner(owner_id))
            .await
    }

    async fn adjust_balance(&self, id: AccountId, delta: Decimal) -> Result<Decimal> {
        self.committing("adjust_balance", self.inner.adjust_balance(id, delta))
            .await
    }

    async fn adjust_balance_with_entry(
        &self,
        id: AccountId,
        delta: Decimal,
    ) -> Result<(Decimal, LedgerEntry)> {
        self.committing(
            "adjust_balance_with_entry",
            self.inner.adjust_balance_with_entry(id, delta),
        )
        .await
    }

    async fn transfer_atomic(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<()> {
        self.committing("transfer_atomic", self.inner.transfer_atomic(from, to, amount))
            .await
    }

    async fn append_entry(
        &self,
        account_id: AccountId,
        amount: Decimal,
        entry_type: EntryType,
        status: EntryStatus,
    ) -> Result<LedgerEntry> {
        self.committing(
            "append_entry",
            self.inner.append_entry(account_id, amount, entry_type, status),
        )
        .await
    }

    async fn append_transfer_legs(&self, legs: TransferLegs) -> Result<[LedgerEntry; 2]> {
        self.committing("append_transfer_legs", self.inner.append_transfer_legs(legs))
            .await
    }

    async fn entries_by_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        self.bounded("entries_by_account", self.inner.entries_by_account(account_id))
            .await
    }

    async fn entries_by_owner(&self, owner_id: OwnerId) -> Result<Vec<LedgerEntry>> {
        self.bounded("entries_by_owner", self.inner.entries_by_owner(owner_id))
            .await
    }
}
