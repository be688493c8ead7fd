//! Money movement between two accounts.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use bankcore_common::{AccountId, BankError, OwnerId, Result, TransferId};
use bankcore_ledger::{LedgerEntry, LedgerStore, TransferLegs};

use crate::metrics::SharedMetrics;

/// Result of a committed and recorded transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Links the two entries.
    pub transfer_id: TransferId,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Decimal,
    /// `TRANSFER_OUT` entry on the sender.
    pub debit: LedgerEntry,
    /// `TRANSFER_IN` entry on the receiver.
    pub credit: LedgerEntry,
}

/// Executes transfers: validation, atomic movement, then the two-leg record.
pub struct TransferEngine {
    store: Arc<dyn LedgerStore>,
    metrics: SharedMetrics,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn LedgerStore>, metrics: SharedMetrics) -> Self {
        Self { store, metrics }
    }

    /// Move `amount` from `from` to `to` on behalf of the owner of `from`.
    #[instrument(skip(self), fields(from = %from, to = %to, requester = %requester, amount = %amount))]
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        requester: OwnerId,
        amount: Decimal,
    ) -> Result<TransferReceipt> {
        self.metrics.transfer_initiated();

        match self.execute(from, to, requester, amount).await {
            Ok(receipt) => {
                self.metrics.transfer_success();
                Ok(receipt)
            }
            Err(e) => {
                self.metrics.transfer_failed(&e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        from: AccountId,
        to: AccountId,
        requester: OwnerId,
        amount: Decimal,
    ) -> Result<TransferReceipt> {
        if from == to {
            return Err(BankError::SameAccount(from));
        }
        if amount <= Decimal::ZERO {
            return Err(BankError::NonPositiveAmount(amount));
        }

        let source = self.store.get_account(from).await?;
        source.ensure_owned_by(requester)?;

        if source.currency.round(amount) != amount {
            return Err(BankError::InvalidAmount);
        }

        // Advisory only; the conditional debit below is authoritative.
        if !source.has_sufficient_funds(amount) {
            return Err(BankError::InsufficientFunds {
                account_id: from,
                requested: amount,
            });
        }

        let destination = self.store.get_account(to).await?;
        if destination.currency != source.currency {
            return Err(BankError::CurrencyMismatch {
                expected: source.currency,
                actual: destination.currency,
            });
        }

        if let Err(e) = self.store.transfer_atomic(from, to, amount).await {
            match &e {
                BankError::InsufficientFunds { .. } => {
                    warn!("Transfer lost a race for funds after pre-check");
                }
                e if e.is_storage_fault() => {
                    error!(error = %e, "Transfer aborted by storage fault");
                }
                _ => {}
            }
            return Err(e);
        }

        let legs = TransferLegs::new(from, to, amount);
        let transfer_id = legs.transfer_id();

        match self.store.append_transfer_legs(legs).await {
            Ok([debit, credit]) => {
                info!(transfer_id = %transfer_id, "Transfer completed");
                Ok(TransferReceipt {
                    transfer_id,
                    from,
                    to,
                    amount,
                    debit,
                    credit,
                })
            }
            Err(e) => {
                error!(
                    transfer_id = %transfer_id,
                    error = %e,
                    "Funds moved but transfer entries were not recorded"
                );
                Err(BankError::AuditTrailDiverged {
                    operation: "transfer".to_string(),
                    accounts: vec![from, to],
                    amount,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use bankcore_common::Currency;
    use bankcore_ledger::{EntryStatus, EntryType, MemoryStore};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    struct Fixture {
        memory: Arc<MemoryStore>,
        metrics: SharedMetrics,
        engine: Arc<TransferEngine>,
    }

    fn fixture() -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let engine = Arc::new(TransferEngine::new(memory.clone(), metrics.clone()));
        Fixture {
            memory,
            metrics,
            engine,
        }
    }

    async fn open(memory: &MemoryStore, owner: OwnerId, balance: Decimal) -> AccountId {
        let account = memory.create_account(owner, Currency::Rub).await.unwrap();
        if balance > Decimal::ZERO {
            memory.adjust_balance(account.id, balance).await.unwrap();
        }
        account.id
    }

    async fn balance(memory: &MemoryStore, id: AccountId) -> Decimal {
        memory.get_account(id).await.unwrap().balance
    }

    #[tokio::test]
    async fn test_full_balance_transfer() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let a = open(&f.memory, alice, dec!(500)).await;
        let b = open(&f.memory, OwnerId::new(2), dec!(0)).await;

        let receipt = f.engine.transfer(a, b, alice, dec!(500)).await.unwrap();

        assert_eq!(balance(&f.memory, a).await, dec!(0));
        assert_eq!(balance(&f.memory, b).await, dec!(500));

        assert_eq!(receipt.debit.account_id, a);
        assert_eq!(receipt.debit.entry_type, EntryType::TransferOut);
        assert_eq!(receipt.credit.account_id, b);
        assert_eq!(receipt.credit.entry_type, EntryType::TransferIn);
        for entry in [&receipt.debit, &receipt.credit] {
            assert_eq!(entry.amount, dec!(500));
            assert_eq!(entry.status, EntryStatus::Completed);
            assert_eq!(entry.transfer_id, Some(receipt.transfer_id));
        }
        assert_eq!(f.memory.entries_by_account(a).await.unwrap().len(), 1);
        assert_eq!(f.memory.entries_by_account(b).await.unwrap().len(), 1);
        assert_eq!(f.metrics.snapshot().transfers_success, 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_changes_nothing() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let a = open(&f.memory, alice, dec!(100)).await;
        let b = open(&f.memory, OwnerId::new(2), dec!(0)).await;

        let err = f.engine.transfer(a, b, alice, dec!(150)).await.unwrap_err();
        assert_eq!(
            err,
            BankError::InsufficientFunds {
                account_id: a,
                requested: dec!(150)
            }
        );

        assert_eq!(balance(&f.memory, a).await, dec!(100));
        assert_eq!(balance(&f.memory, b).await, dec!(0));
        assert_eq!(f.memory.entry_count(), 0);
        assert_eq!(f.metrics.snapshot().transfers_rejected, 1);
    }

    #[tokio::test]
    async fn test_validation_precedes_lookup() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let a = open(&f.memory, alice, dec!(100)).await;
        let missing = AccountId::new();

        assert_eq!(
            f.engine.transfer(a, a, alice, dec!(10)).await.unwrap_err(),
            BankError::SameAccount(a)
        );
        for amount in [dec!(0), dec!(-5)] {
            assert_eq!(
                f.engine.transfer(a, missing, alice, amount).await.unwrap_err(),
                BankError::NonPositiveAmount(amount)
            );
        }
        assert_eq!(
            f.engine.transfer(missing, a, alice, dec!(10)).await.unwrap_err(),
            BankError::AccountNotFound(missing)
        );
        assert_eq!(
            f.engine.transfer(a, missing, alice, dec!(10)).await.unwrap_err(),
            BankError::AccountNotFound(missing)
        );
        assert_eq!(balance(&f.memory, a).await, dec!(100));
        assert_eq!(f.memory.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_requester_must_own_source() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let bob = OwnerId::new(2);
        let a = open(&f.memory, alice, dec!(100)).await;
        let b = open(&f.memory, bob, dec!(0)).await;

        let err = f.engine.transfer(a, b, bob, dec!(10)).await.unwrap_err();
        assert_eq!(
            err,
            BankError::NotOwner {
                account_id: a,
                requester: bob
            }
        );
        assert_eq!(balance(&f.memory, a).await, dec!(100));
    }

    #[tokio::test]
    async fn test_amount_finer_than_currency_rejected_after_ownership() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let bob = OwnerId::new(2);
        let a = open(&f.memory, alice, dec!(100)).await;
        let b = open(&f.memory, bob, dec!(0)).await;
        let missing = AccountId::new();

        assert_eq!(
            f.engine.transfer(a, b, alice, dec!(10.005)).await.unwrap_err(),
            BankError::InvalidAmount
        );
        // Ownership is checked on the loaded source first.
        assert!(matches!(
            f.engine.transfer(a, b, bob, dec!(10.005)).await.unwrap_err(),
            BankError::NotOwner { .. }
        ));
        // Precision is checked before funds and before the destination lookup.
        assert_eq!(
            f.engine.transfer(a, b, alice, dec!(150.005)).await.unwrap_err(),
            BankError::InvalidAmount
        );
        assert_eq!(
            f.engine.transfer(a, missing, alice, dec!(0.001)).await.unwrap_err(),
            BankError::InvalidAmount
        );

        assert_eq!(balance(&f.memory, a).await, dec!(100));
        assert_eq!(balance(&f.memory, b).await, dec!(0));
        assert_eq!(f.memory.entry_count(), 0);
        assert_eq!(f.metrics.snapshot().transfers_rejected, 4);
    }

    #[tokio::test]
    async fn test_currency_mismatch_rejected() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let a = open(&f.memory, alice, dec!(100)).await;
        let usd = f.memory.create_account(OwnerId::new(2), Currency::Usd).await.unwrap();

        let err = f.engine.transfer(a, usd.id, alice, dec!(10)).await.unwrap_err();
        assert_eq!(
            err,
            BankError::CurrencyMismatch {
                expected: Currency::Rub,
                actual: Currency::Usd
            }
        );
        assert_eq!(balance(&f.memory, a).await, dec!(100));
    }

    #[tokio::test]
    async fn test_entry_failure_after_commit_diverges() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let a = open(&f.memory, alice, dec!(80)).await;
        let b = open(&f.memory, OwnerId::new(2), dec!(0)).await;

        f.memory.faults().set_fail_entry_appends(true);
        let err = f.engine.transfer(a, b, alice, dec!(30)).await.unwrap_err();

        assert!(err.money_moved());
        assert!(!err.is_retryable());
        assert!(matches!(
            &err,
            BankError::AuditTrailDiverged { accounts, .. } if accounts == &vec![a, b]
        ));
        assert_eq!(balance(&f.memory, a).await, dec!(50));
        assert_eq!(balance(&f.memory, b).await, dec!(30));
        assert_eq!(f.memory.entry_count(), 0);

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.audit_divergences, 1);
        assert_eq!(snapshot.transfers_rejected, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_transfers_do_not_deadlock() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let bob = OwnerId::new(2);
        let a = open(&f.memory, alice, dec!(1000)).await;
        let b = open(&f.memory, bob, dec!(1000)).await;

        let mut handles = Vec::new();
        for i in 0..100 {
            let engine = f.engine.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    engine.transfer(a, b, alice, dec!(7)).await
                } else {
                    engine.transfer(b, a, bob, dec!(3)).await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // 50 * 7 out of A, 50 * 3 back in.
        assert_eq!(balance(&f.memory, a).await, dec!(800));
        assert_eq!(balance(&f.memory, b).await, dec!(1200));
        assert_eq!(f.memory.entry_count(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overdraft_allows_exactly_one() {
        let f = fixture();
        let alice = OwnerId::new(1);
        let a = open(&f.memory, alice, dec!(100)).await;
        let b = open(&f.memory, OwnerId::new(2), dec!(0)).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = f.engine.clone();
            handles.push(tokio::spawn(async move {
                engine.transfer(a, b, alice, dec!(100)).await
            }));
        }

        let mut committed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => committed += 1,
                Err(e) => assert!(matches!(e, BankError::InsufficientFunds { .. })),
            }
        }

        assert_eq!(committed, 1);
        assert_eq!(balance(&f.memory, a).await, dec!(0));
        assert_eq!(balance(&f.memory, b).await, dec!(100));
        assert_eq!(f.memory.entry_count(), 2);
    }

    proptest! {
        #[test]
        fn prop_transfers_conserve_total(
            opening in proptest::collection::vec(0u32..500, 3),
            moves in proptest::collection::vec((0usize..3, 0usize..3, 1u32..300), 1..40),
        ) {
            tokio_test::block_on(async {
                let f = fixture();
                let owners: Vec<OwnerId> = (0..3).map(OwnerId::new).collect();
                let mut ids = Vec::new();
                for (owner, amount) in owners.iter().zip(&opening) {
                    ids.push(open(&f.memory, *owner, Decimal::from(*amount)).await);
                }
                let total = f.memory.total_balance();

                for (from, to, amount) in moves {
                    let result = f
                        .engine
                        .transfer(ids[from], ids[to], owners[from], Decimal::from(amount))
                        .await;
                    if from == to {
                        assert!(matches!(result, Err(BankError::SameAccount(_))));
                    }
                }

                assert_eq!(f.memory.total_balance(), total);
                for id in &ids {
                    assert!(balance(&f.memory, *id).await >= Decimal::ZERO);
                }
            });
        }
    }
}
