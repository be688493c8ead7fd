//! Read paths over accounts and the ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use bankcore_common::{AccountId, OwnerId, Result};
use bankcore_ledger::{Account, EntryStatus, LedgerEntry, LedgerStore};

/// Comparison of an account's stored balance with its ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account_id: AccountId,
    /// Balance held on the account row.
    pub recorded_balance: Decimal,
    /// Credits minus debits over completed entries.
    pub ledger_balance: Decimal,
    /// `recorded_balance - ledger_balance`.
    pub discrepancy: Decimal,
    /// Completed entries summed.
    pub entries_counted: usize,
    pub checked_at: DateTime<Utc>,
}

impl Reconciliation {
    /// Check if the ledger fully explains the balance.
    pub fn is_consistent(&self) -> bool {
        self.discrepancy.is_zero()
    }
}

/// Ownership-checked reads.
pub struct QueryService {
    store: Arc<dyn LedgerStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Accounts belonging to `owner`, ordered by id.
    pub async fn accounts_by_owner(&self, owner: OwnerId) -> Result<Vec<Account>> {
        self.store.accounts_by_owner(owner).await
    }

    /// A single account, only if `requester` owns it.
    pub async fn get_account(&self, account_id: AccountId, requester: OwnerId) -> Result<Account> {
        let account = self.store.get_account(account_id).await?;
        account.ensure_owned_by(requester)?;
        Ok(account)
    }

    /// Entries of one account, newest first.
    pub async fn transactions_by_account(
        &self,
        account_id: AccountId,
        requester: OwnerId,
    ) -> Result<Vec<LedgerEntry>> {
        self.get_account(account_id, requester).await?;
        self.store.entries_by_account(account_id).await
    }

    /// Entries across every account of `owner`, newest first.
    pub async fn transactions_by_owner(&self, owner: OwnerId) -> Result<Vec<LedgerEntry>> {
        self.store.entries_by_owner(owner).await
    }

    /// Recompute the balance from the account's ledger and compare.
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        account_id: AccountId,
        requester: OwnerId,
    ) -> Result<Reconciliation> {
        let account = self.get_account(account_id, requester).await?;
        let entries = self.store.entries_by_account(account_id).await?;

        let completed: Vec<&LedgerEntry> = entries
            .iter()
            .filter(|entry| entry.status == EntryStatus::Completed)
            .collect();
        let ledger_balance: Decimal = completed.iter().map(|entry| entry.signed_amount()).sum();

        let report = Reconciliation {
            account_id,
            recorded_balance: account.balance,
            ledger_balance,
            discrepancy: account.balance - ledger_balance,
            entries_counted: completed.len(),
            checked_at: Utc::now(),
        };

        if !report.is_consistent() {
            warn!(
                account_id = %account_id,
                recorded = %report.recorded_balance,
                ledger = %report.ledger_balance,
                "Balance not explained by ledger"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::mutator::BalanceMutator;
    use crate::transfer::TransferEngine;
    use bankcore_common::{BankError, Currency};
    use bankcore_ledger::{EntryType, MemoryStore};
    use rust_decimal_macros::dec;

    struct Fixture {
        memory: Arc<MemoryStore>,
        mutator: BalanceMutator,
        transfers: TransferEngine,
        queries: QueryService,
    }

    fn fixture() -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        Fixture {
            mutator: BalanceMutator::new(memory.clone(), metrics.clone()),
            transfers: TransferEngine::new(memory.clone(), metrics),
            queries: QueryService::new(memory.clone()),
            memory,
        }
    }

    #[tokio::test]
    async fn test_transactions_require_ownership() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let a = f.memory.create_account(alice, Currency::Rub).await.unwrap().id;
        f.mutator.update_balance(a, alice, dec!(10)).await.unwrap();

        let entries = f.queries.transactions_by_account(a, alice).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::Deposit);

        let err = f
            .queries
            .transactions_by_account(a, OwnerId::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::NotOwner { .. }));

        let missing = AccountId::new();
        assert_eq!(
            f.queries.get_account(missing, alice).await.unwrap_err(),
            BankError::AccountNotFound(missing)
        );
    }

    #[tokio::test]
    async fn test_owner_views_span_accounts() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let a1 = f.memory.create_account(alice, Currency::Rub).await.unwrap().id;
        let a2 = f.memory.create_account(alice, Currency::Rub).await.unwrap().id;
        f.memory.create_account(OwnerId::new(2), Currency::Rub).await.unwrap();

        f.mutator.update_balance(a1, alice, dec!(50)).await.unwrap();
        f.transfers.transfer(a1, a2, alice, dec!(20)).await.unwrap();

        let accounts = f.queries.accounts_by_owner(alice).await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(accounts.windows(2).all(|w| w[0].id < w[1].id));

        let entries = f.queries.transactions_by_owner(alice).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].entry_type, EntryType::Deposit);

        assert!(f.queries.accounts_by_owner(OwnerId::new(3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_consistent_ledger() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let bob = OwnerId::new(2);
        let a = f.memory.create_account(alice, Currency::Rub).await.unwrap().id;
        let b = f.memory.create_account(bob, Currency::Rub).await.unwrap().id;

        f.mutator.update_balance(a, alice, dec!(300)).await.unwrap();
        f.mutator.update_balance(a, alice, dec!(-50)).await.unwrap();
        f.transfers.transfer(a, b, alice, dec!(100)).await.unwrap();

        let report = f.queries.reconcile(a, alice).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.recorded_balance, dec!(150));
        assert_eq!(report.entries_counted, 3);

        let report = f.queries.reconcile(b, bob).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.ledger_balance, dec!(100));
    }

    #[tokio::test]
    async fn test_reconcile_surfaces_divergence() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let bob = OwnerId::new(2);
        let a = f.memory.create_account(alice, Currency::Rub).await.unwrap().id;
        let b = f.memory.create_account(bob, Currency::Rub).await.unwrap().id;
        f.mutator.update_balance(a, alice, dec!(100)).await.unwrap();

        f.memory.faults().set_fail_entry_appends(true);
        let err = f.transfers.transfer(a, b, alice, dec!(40)).await.unwrap_err();
        assert!(err.money_moved());
        f.memory.faults().clear();

        let sender = f.queries.reconcile(a, alice).await.unwrap();
        assert!(!sender.is_consistent());
        assert_eq!(sender.recorded_balance, dec!(60));
        assert_eq!(sender.ledger_balance, dec!(100));
        assert_eq!(sender.discrepancy, dec!(-40));

        let receiver = f.queries.reconcile(b, bob).await.unwrap();
        assert_eq!(receiver.discrepancy, dec!(40));
    }
}
