//! The banking core facade.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use bankcore_common::{AccountId, BankError, Currency, OwnerId, Result};
use bankcore_ledger::{Account, LedgerEntry, LedgerStore, MemoryStore, PgLedgerStore};

use crate::config::{EngineConfig, StoreBackend};
use crate::deadline::TimedStore;
use crate::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use crate::mutator::BalanceMutator;
use crate::query::{QueryService, Reconciliation};
use crate::transfer::{TransferEngine, TransferReceipt};

/// Entry point for every account, balance and transfer operation.
///
/// Owns the store handle, so independent instances never share state.
/// Every storage call made through it is bounded by
/// [`EngineConfig::storage_timeout`].
pub struct Bank {
    config: EngineConfig,
    store: Arc<dyn LedgerStore>,
    metrics: SharedMetrics,
    mutator: BalanceMutator,
    transfers: TransferEngine,
    queries: QueryService,
}

impl Bank {
    /// Build a bank over an existing store.
    pub fn new(config: EngineConfig, backend: Arc<dyn LedgerStore>) -> Self {
        let store: Arc<dyn LedgerStore> =
            Arc::new(TimedStore::new(backend, config.storage_timeout));
        let metrics = Arc::new(Metrics::new());

        Self {
            mutator: BalanceMutator::new(store.clone(), metrics.clone()),
            transfers: TransferEngine::new(store.clone(), metrics.clone()),
            queries: QueryService::new(store.clone()),
            config,
            store,
            metrics,
        }
    }

    /// Validate `config` and open the backend it names.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        config.validate().map_err(BankError::Configuration)?;

        let backend: Arc<dyn LedgerStore> = match config.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Postgres => {
                let store = PgLedgerStore::connect(&config.database)
                    .await?
                    .with_commit_deadline(config.storage_timeout);
                if config.run_migrations {
                    store.migrate().await?;
                }
                Arc::new(store)
            }
        };

        info!(
            backend = %config.backend,
            storage_timeout_ms = config.storage_timeout.as_millis() as u64,
            "Bank ready"
        );
        Ok(Self::new(config, backend))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Open a zero-balance account. Only RUB accounts can be opened.
    #[instrument(skip(self))]
    pub async fn create_account(&self, owner: OwnerId, currency: Currency) -> Result<Account> {
        if !currency.accepts_new_accounts() {
            warn!(currency = %currency, "Account currency not accepted");
            return Err(BankError::UnsupportedCurrency(currency));
        }

        let account = self.store.create_account(owner, currency).await?;
        self.metrics.account_created();
        info!(account_id = %account.id, owner = %owner, "Account opened");
        Ok(account)
    }

    pub async fn accounts_by_owner(&self, owner: OwnerId) -> Result<Vec<Account>> {
        self.queries.accounts_by_owner(owner).await
    }

    pub async fn get_account(&self, account_id: AccountId, requester: OwnerId) -> Result<Account> {
        self.queries.get_account(account_id, requester).await
    }

    /// See [`BalanceMutator::update_balance`].
    pub async fn update_balance(
        &self,
        account_id: AccountId,
        requester: OwnerId,
        delta: Decimal,
    ) -> Result<Account> {
        self.mutator.update_balance(account_id, requester, delta).await
    }

    /// See [`TransferEngine::transfer`].
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        requester: OwnerId,
        amount: Decimal,
    ) -> Result<TransferReceipt> {
        self.transfers.transfer(from, to, requester, amount).await
    }

    pub async fn transactions_by_account(
        &self,
        account_id: AccountId,
        requester: OwnerId,
    ) -> Result<Vec<LedgerEntry>> {
        self.queries.transactions_by_account(account_id, requester).await
    }

    pub async fn transactions_by_owner(&self, owner: OwnerId) -> Result<Vec<LedgerEntry>> {
        self.queries.transactions_by_owner(owner).await
    }

    pub async fn reconcile(
        &self,
        account_id: AccountId,
        requester: OwnerId,
    ) -> Result<Reconciliation> {
        self.queries.reconcile(account_id, requester).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bankcore_ledger::EntryType;
    use rust_decimal_macros::dec;

    fn bank_over(memory: &Arc<MemoryStore>, storage_timeout: Duration) -> Bank {
        let config = EngineConfig {
            storage_timeout,
            ..EngineConfig::default()
        };
        Bank::new(config, memory.clone())
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let bank = Bank::connect(EngineConfig::default()).await.unwrap();
        let owner = OwnerId::new(1);

        let account = bank.create_account(owner, Currency::Rub).await.unwrap();
        assert_eq!(account.balance, Decimal::ZERO);
        assert_eq!(bank.accounts_by_owner(owner).await.unwrap(), vec![account]);
        assert_eq!(bank.metrics().accounts_created, 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let config = EngineConfig {
            storage_timeout: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Bank::connect(config).await,
            Err(BankError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_only_rub_accounts_open() {
        let memory = Arc::new(MemoryStore::new());
        let bank = bank_over(&memory, Duration::from_secs(1));

        for currency in [Currency::Usd, Currency::Eur] {
            assert_eq!(
                bank.create_account(OwnerId::new(1), currency).await.unwrap_err(),
                BankError::UnsupportedCurrency(currency)
            );
        }
        assert!(bank.accounts_by_owner(OwnerId::new(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_flow() {
        let memory = Arc::new(MemoryStore::new());
        let bank = bank_over(&memory, Duration::from_secs(1));
        let alice = OwnerId::new(1);
        let bob = OwnerId::new(2);
        let a = bank.create_account(alice, Currency::Rub).await.unwrap().id;
        let b = bank.create_account(bob, Currency::Rub).await.unwrap().id;

        bank.update_balance(a, alice, dec!(500)).await.unwrap();
        let receipt = bank.transfer(a, b, alice, dec!(200)).await.unwrap();
        assert_eq!(receipt.amount, dec!(200));

        assert_eq!(bank.get_account(a, alice).await.unwrap().balance, dec!(300));
        assert_eq!(bank.get_account(b, bob).await.unwrap().balance, dec!(200));

        let history = bank.transactions_by_account(a, alice).await.unwrap();
        assert_eq!(history[0].entry_type, EntryType::TransferOut);
        assert_eq!(history[1].entry_type, EntryType::Deposit);
        assert_eq!(bank.transactions_by_owner(bob).await.unwrap().len(), 1);

        assert!(bank.reconcile(a, alice).await.unwrap().is_consistent());
        assert!(bank.reconcile(b, bob).await.unwrap().is_consistent());
        assert_eq!(memory.total_balance(), dec!(500));
    }

    #[tokio::test]
    async fn test_slow_storage_times_out_without_mutation() {
        let memory = Arc::new(MemoryStore::new());
        let bank = bank_over(&memory, Duration::from_millis(30));
        let alice = OwnerId::new(1);
        let a = bank.create_account(alice, Currency::Rub).await.unwrap().id;
        let b = bank.create_account(OwnerId::new(2), Currency::Rub).await.unwrap().id;
        bank.update_balance(a, alice, dec!(100)).await.unwrap();

        memory.faults().set_latency(Duration::from_millis(300));
        let err = bank.transfer(a, b, alice, dec!(50)).await.unwrap_err();
        assert!(matches!(err, BankError::StorageTimeout(_)));
        assert!(err.is_retryable());
        memory.faults().clear();

        assert_eq!(memory.get_account(a).await.unwrap().balance, dec!(100));
        assert_eq!(memory.get_account(b).await.unwrap().balance, dec!(0));
        assert_eq!(memory.entry_count(), 1);

        let snapshot = bank.metrics();
        assert_eq!(snapshot.storage_timeouts, 1);
        assert_eq!(snapshot.transfers_rejected, 1);
    }

    #[tokio::test]
    async fn test_cancelled_transfer_leaves_no_trace() {
        let memory = Arc::new(MemoryStore::new());
        let bank = bank_over(&memory, Duration::from_secs(5));
        let alice = OwnerId::new(1);
        let a = bank.create_account(alice, Currency::Rub).await.unwrap().id;
        let b = bank.create_account(OwnerId::new(2), Currency::Rub).await.unwrap().id;
        bank.update_balance(a, alice, dec!(100)).await.unwrap();

        memory.faults().set_latency(Duration::from_millis(200));
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), bank.transfer(a, b, alice, dec!(60)))
                .await;
        assert!(cancelled.is_err());
        memory.faults().clear();

        assert_eq!(memory.get_account(a).await.unwrap().balance, dec!(100));
        assert_eq!(memory.entry_count(), 1);
    }
}
