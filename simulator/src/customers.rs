//! Simulated customers and their accounts.

use anyhow::Context;
use rust_decimal::Decimal;
use tracing::info;

use bankcore_common::{AccountId, Currency, OwnerId};
use bankcore_engine::Bank;

/// A customer holding one RUB account.
#[derive(Debug, Clone)]
pub struct Customer {
    /// Label used by scenarios.
    pub label: String,
    pub owner: OwnerId,
    pub account: AccountId,
}

/// Labels for the first customers; the rest are numbered.
const LABELS: [&str; 10] = [
    "ALICE", "BOB", "CAROL", "DAVE", "ERIN", "FRANK", "GRACE", "HEIDI", "IVAN", "JUDY",
];

fn label(index: usize) -> String {
    LABELS
        .get(index)
        .map(|label| label.to_string())
        .unwrap_or_else(|| format!("CUSTOMER_{}", index + 1))
}

/// Factory for funded customers.
pub struct CustomerFactory;

impl CustomerFactory {
    /// Open `count` accounts and deposit `opening_balance` into each.
    ///
    /// Owners are numbered from `first_owner` so repeated runs against a
    /// persistent store do not share owners.
    pub async fn open(
        bank: &Bank,
        count: usize,
        first_owner: i64,
        opening_balance: Decimal,
    ) -> anyhow::Result<Vec<Customer>> {
        let mut customers = Vec::with_capacity(count);

        for index in 0..count {
            let owner = OwnerId::new(first_owner + index as i64);
            let account = bank
                .create_account(owner, Currency::Rub)
                .await
                .with_context(|| format!("opening account for owner {owner}"))?;

            if opening_balance > Decimal::ZERO {
                bank.update_balance(account.id, owner, opening_balance)
                    .await
                    .with_context(|| format!("funding account {}", account.id))?;
            }

            let customer = Customer {
                label: label(index),
                owner,
                account: account.id,
            };
            info!(
                customer = %customer.label,
                account_id = %customer.account,
                balance = %opening_balance,
                "Customer opened"
            );
            customers.push(customer);
        }

        Ok(customers)
    }
}
