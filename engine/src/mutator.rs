//! Direct balance changes on a single account.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, instrument, warn};

use bankcore_common::{AccountId, BankError, OwnerId, Result};
use bankcore_ledger::{Account, LedgerStore};

use crate::metrics::SharedMetrics;

/// Applies signed deltas to an owner's account and records one entry each.
pub struct BalanceMutator {
    store: Arc<dyn LedgerStore>,
    metrics: SharedMetrics,
}

impl BalanceMutator {
    pub fn new(store: Arc<dyn LedgerStore>, metrics: SharedMetrics) -> Self {
        Self { store, metrics }
    }

    /// Add `delta` to the account's balance on behalf of `requester`.
    ///
    /// A positive delta is recorded as a `DEPOSIT`, a negative one as a
    /// `WITHDRAWAL`, both with magnitude `|delta|`. The balance and its entry
    /// are written together or not at all.
    #[instrument(skip(self), fields(account_id = %account_id, requester = %requester))]
    pub async fn update_balance(
        &self,
        account_id: AccountId,
        requester: OwnerId,
        delta: Decimal,
    ) -> Result<Account> {
        let result = self.apply(account_id, requester, delta).await;
        match &result {
            Ok(_) => self.metrics.balance_updated(),
            Err(e) => self.metrics.record_error(e),
        }
        result
    }

    async fn apply(
        &self,
        account_id: AccountId,
        requester: OwnerId,
        delta: Decimal,
    ) -> Result<Account> {
        if delta.is_zero() {
            return Err(BankError::InvalidAmount);
        }

        let account = self.store.get_account(account_id).await?;
        account.ensure_owned_by(requester)?;

        if account.currency.round(delta) != delta {
            return Err(BankError::InvalidAmount);
        }

        let recorded = self.store.adjust_balance_with_entry(account_id, delta).await;
        let (balance, entry) = match recorded {
            Ok(recorded) => recorded,
            Err(e @ BankError::InsufficientFunds { .. }) => {
                warn!(delta = %delta, balance = %account.balance, "Balance update rejected");
                return Err(e);
            }
            Err(e) => {
                if e.is_storage_fault() {
                    error!(error = %e, "Balance update aborted by storage fault");
                }
                return Err(e);
            }
        };

        info!(
            delta = %delta,
            balance = %balance,
            entry_type = %entry.entry_type,
            "Balance updated"
        );

        Ok(Account { balance, ..account })
    }
}
