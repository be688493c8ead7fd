//! The ledger store contract.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use bankcore_common::{AccountId, Currency, OwnerId, Result};

use crate::account::Account;
use crate::journal::{EntryStatus, EntryType, LedgerEntry, TransferLegs};

/// Durable, transactional persistence for accounts and ledger entries.
///
/// Every mutating method is all-or-nothing: on `Err` no state has changed.
/// Dropping a returned future before it resolves must not leave a partial
/// mutation behind.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Deadline the store itself applies to the work before each commit.
    ///
    /// A store that returns `Some` must never be cut off by an outer
    /// timeout while its commit is in flight, since a dropped commit may
    /// still have been applied. `None` means every mutation is safe to drop
    /// at any await point.
    fn commit_deadline(&self) -> Option<Duration> {
        None
    }

    /// Insert a zero-balance account.
    async fn create_account(&self, owner_id: OwnerId, currency: Currency) -> Result<Account>;

    /// Fetch an account or fail with `AccountNotFound`.
    async fn get_account(&self, id: AccountId) -> Result<Account>;

    /// All accounts of an owner, ordered by id.
    async fn accounts_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Account>>;

    /// Add a signed delta and return the new balance.
    ///
    /// The sufficiency check is evaluated in the same atomic step as the
    /// write; a result below zero fails with `InsufficientFunds`.
    async fn adjust_balance(&self, id: AccountId, delta: Decimal) -> Result<Decimal>;

    /// Add a signed delta and record it as one entry in the same unit.
    ///
    /// The entry is a `DEPOSIT` for a positive delta and a `WITHDRAWAL`
    /// otherwise, with magnitude `|delta|`. If the entry cannot be written
    /// the balance is left untouched.
    async fn adjust_balance_with_entry(
        &self,
        id: AccountId,
        delta: Decimal,
    ) -> Result<(Decimal, LedgerEntry)>;

    /// Debit `from` and credit `to` by `amount` as one unit.
    ///
    /// Row locks are taken in [`lock_order`]. A failed sufficiency guard on
    /// `from` leaves both accounts untouched.
    async fn transfer_atomic(&self, from: AccountId, to: AccountId, amount: Decimal)
        -> Result<()>;

    /// Append a standalone entry.
    async fn append_entry(
        &self,
        account_id: AccountId,
        amount: Decimal,
        entry_type: EntryType,
        status: EntryStatus,
    ) -> Result<LedgerEntry>;

    /// Append both legs of a transfer, or neither.
    async fn append_transfer_legs(&self, legs: TransferLegs) -> Result<[LedgerEntry; 2]>;

    /// Entries of an account, newest first.
    async fn entries_by_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>>;

    /// Entries across all accounts of an owner, newest first.
    async fn entries_by_owner(&self, owner_id: OwnerId) -> Result<Vec<LedgerEntry>>;
}

/// Order in which two accounts must be locked.
///
/// Ascending by id, so two transfers over the same pair in opposite
/// directions always contend on the same first lock.
pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
