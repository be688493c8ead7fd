//! Ledger entry types and the two-leg transfer unit of work.

use std::fmt;
use std::str::FromStr;

use bankcore_common::{now, AccountId, EntryId, Timestamp, TransferId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Type of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// Direct balance increase.
    Deposit,
    /// Direct balance decrease.
    Withdrawal,
    /// Outgoing leg of a transfer (debit on the sender).
    TransferOut,
    /// Incoming leg of a transfer (credit on the receiver).
    TransferIn,
}

impl EntryType {
    /// Entry type documenting a direct signed balance change.
    pub fn for_delta(delta: Decimal) -> Self {
        if delta > Decimal::ZERO {
            EntryType::Deposit
        } else {
            EntryType::Withdrawal
        }
    }

    /// Check if this entry increases the balance.
    pub fn is_credit(&self) -> bool {
        matches!(self, EntryType::Deposit | EntryType::TransferIn)
    }

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Deposit => "DEPOSIT",
            EntryType::Withdrawal => "WITHDRAWAL",
            EntryType::TransferOut => "TRANSFER_OUT",
            EntryType::TransferIn => "TRANSFER_IN",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(EntryType::Deposit),
            "WITHDRAWAL" => Ok(EntryType::Withdrawal),
            "TRANSFER_OUT" => Ok(EntryType::TransferOut),
            "TRANSFER_IN" => Ok(EntryType::TransferIn),
            other => Err(format!("unknown entry type: {other}")),
        }
    }
}

/// Processing status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

impl EntryStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Completed => "COMPLETED",
            EntryStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EntryStatus::Pending),
            "COMPLETED" => Ok(EntryStatus::Completed),
            "FAILED" => Ok(EntryStatus::Failed),
            other => Err(format!("unknown entry status: {other}")),
        }
    }
}

/// An immutable audit record of one balance-affecting event on one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Account affected.
    pub account_id: AccountId,
    /// Positive magnitude of the change.
    pub amount: Decimal,
    /// Direction and origin of the change.
    pub entry_type: EntryType,
    /// Processing status.
    pub status: EntryStatus,
    /// Transfer this entry is a leg of, if any.
    pub transfer_id: Option<TransferId>,
    /// When this entry was created.
    pub created_at: Timestamp,
}

impl LedgerEntry {
    /// Create a standalone entry.
    pub fn new(
        account_id: AccountId,
        amount: Decimal,
        entry_type: EntryType,
        status: EntryStatus,
    ) -> Self {
        Self {
            id: EntryId::new(),
            account_id,
            amount,
            entry_type,
            status,
            transfer_id: None,
            created_at: now(),
        }
    }

    /// Completed entry documenting a direct signed balance change.
    pub fn for_delta(account_id: AccountId, delta: Decimal) -> Self {
        Self::new(
            account_id,
            delta.abs(),
            EntryType::for_delta(delta),
            EntryStatus::Completed,
        )
    }

    /// Signed effect on the account balance.
    pub fn signed_amount(&self) -> Decimal {
        if self.entry_type.is_credit() {
            self.amount
        } else {
            -self.amount
        }
    }
}

/// Both legs of one transfer, appended as a single unit.
///
/// Fields are private: the only way to obtain a value is [`TransferLegs::new`],
/// which always produces a matching debit and credit.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferLegs {
    transfer_id: TransferId,
    debit: LedgerEntry,
    credit: LedgerEntry,
}

impl TransferLegs {
    /// Build the completed legs of a transfer of `amount` from `from` to `to`.
    pub fn new(from: AccountId, to: AccountId, amount: Decimal) -> Self {
        let transfer_id = TransferId::new();
        let created_at = now();

        let leg = |account_id: AccountId, entry_type: EntryType| LedgerEntry {
            id: EntryId::new(),
            account_id,
            amount,
            entry_type,
            status: EntryStatus::Completed,
            transfer_id: Some(transfer_id),
            created_at,
        };

        Self {
            transfer_id,
            debit: leg(from, EntryType::TransferOut),
            credit: leg(to, EntryType::TransferIn),
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// The sender's leg.
    pub fn debit(&self) -> &LedgerEntry {
        &self.debit
    }

    /// The receiver's leg.
    pub fn credit(&self) -> &LedgerEntry {
        &self.credit
    }

    /// Accounts touched, sender first.
    pub fn accounts(&self) -> [AccountId; 2] {
        [self.debit.account_id, self.credit.account_id]
    }

    /// Verify the legs cancel out.
    pub fn is_balanced(&self) -> bool {
        self.debit.signed_amount() + self.credit.signed_amount() == Decimal::ZERO
    }

    /// Consume into `[debit, credit]`.
    pub fn into_entries(self) -> [LedgerEntry; 2] {
        [self.debit, self.credit]
    }
}
