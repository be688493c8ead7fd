//! Account definitions for the ledger.

use bankcore_common::{now, AccountId, BankError, Currency, OwnerId, Result, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A customer account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Current balance. Never negative once committed.
    pub balance: Decimal,
    /// Account currency.
    pub currency: Currency,
    /// When the account was opened.
    pub created_at: Timestamp,
}

impl Account {
    /// Open a new zero-balance account.
    pub fn open(owner_id: OwnerId, currency: Currency) -> Self {
        Self {
            id: AccountId::new(),
            owner_id,
            balance: Decimal::ZERO,
            currency,
            created_at: now(),
        }
    }

    /// Check if the account belongs to the given owner.
    pub fn is_owned_by(&self, owner_id: OwnerId) -> bool {
        self.owner_id == owner_id
    }

    /// Fail with `NotOwner` unless the requester owns the account.
    pub fn ensure_owned_by(&self, requester: OwnerId) -> Result<()> {
        if self.is_owned_by(requester) {
            Ok(())
        } else {
            Err(BankError::NotOwner {
                account_id: self.id,
                requester,
            })
        }
    }

    /// Check if account has sufficient funds for a debit.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    /// Apply a signed delta, refusing to go below zero.
    ///
    /// Leaves the balance untouched on failure. Callers must hold whatever
    /// guard makes the read and the write one atomic step.
    pub(crate) fn apply_delta(&mut self, delta: Decimal) -> Result<Decimal> {
        let next = self.balance + delta;
        if next < Decimal::ZERO {
            return Err(BankError::InsufficientFunds {
                account_id: self.id,
                requested: delta.abs(),
            });
        }
        self.balance = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_has_zero_balance() {
        let account = Account::open(OwnerId::new(1), Currency::Rub);
        assert_eq!(account.balance, Decimal::ZERO);
        assert!(account.is_owned_by(OwnerId::new(1)));
        assert!(!account.is_owned_by(OwnerId::new(2)));
    }

    #[test]
    fn test_ensure_owned_by() {
        let account = Account::open(OwnerId::new(1), Currency::Rub);
        assert!(account.ensure_owned_by(OwnerId::new(1)).is_ok());
        assert_eq!(
            account.ensure_owned_by(OwnerId::new(7)),
            Err(BankError::NotOwner {
                account_id: account.id,
                requester: OwnerId::new(7),
            })
        );
    }

    #[test]
    fn test_apply_delta_guards_negative() {
        let mut account = Account::open(OwnerId::new(1), Currency::Rub);
        assert_eq!(account.apply_delta(dec!(30)).unwrap(), dec!(30));

        let err = account.apply_delta(dec!(-50)).unwrap_err();
        assert!(matches!(err, BankError::InsufficientFunds { requested, .. } if requested == dec!(50)));
        assert_eq!(account.balance, dec!(30));

        assert_eq!(account.apply_delta(dec!(-30)).unwrap(), Decimal::ZERO);
    }
}
