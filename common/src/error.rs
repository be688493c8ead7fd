//! Error types for ledger operations.

use crate::{AccountId, Currency, OwnerId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for ledger operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BankError {
    /// Account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Requester does not own the account.
    #[error("Account {account_id} is not owned by {requester}")]
    NotOwner {
        account_id: AccountId,
        requester: OwnerId,
    },

    /// Zero delta, or more decimal places than the currency carries.
    #[error("Invalid amount: must be non-zero and within currency precision")]
    InvalidAmount,

    /// Transfer amount is zero or negative.
    #[error("Transfer amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),

    /// Transfer source and destination are the same account.
    #[error("Cannot transfer to the same account: {0}")]
    SameAccount(AccountId),

    /// Debit would drive the balance negative.
    #[error("Insufficient funds on {account_id}: requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        requested: Decimal,
    },

    /// Accounts cannot currently be opened in this currency.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(Currency),

    /// Transfer between accounts of different currencies.
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Storage layer failure; the operation was rolled back.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Storage call exceeded its deadline; the operation was rolled back.
    #[error("Storage operation timed out: {0}")]
    StorageTimeout(String),

    /// Balances were committed but the ledger entries could not be written.
    #[error("Ledger entries missing for committed {operation} on {accounts:?}: {reason}")]
    AuditTrailDiverged {
        operation: String,
        accounts: Vec<AccountId>,
        amount: Decimal,
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BankError {
    /// Check if this error originates in the storage layer.
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, BankError::Storage(_) | BankError::StorageTimeout(_))
    }

    /// Check if this error is retryable.
    ///
    /// Only rolled-back storage faults qualify; retrying a diverged operation
    /// would move the money twice.
    pub fn is_retryable(&self) -> bool {
        self.is_storage_fault()
    }

    /// Whether money moved despite the error.
    pub fn money_moved(&self) -> bool {
        matches!(self, BankError::AuditTrailDiverged { .. })
    }

    /// Get error code for the transport layer.
    pub fn error_code(&self) -> &'static str {
        match self {
            BankError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            BankError::NotOwner { .. } => "NOT_OWNER",
            BankError::InvalidAmount => "INVALID_AMOUNT",
            BankError::NonPositiveAmount(_) => "NON_POSITIVE_AMOUNT",
            BankError::SameAccount(_) => "SAME_ACCOUNT",
            BankError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            BankError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            BankError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            BankError::Storage(_) => "STORAGE_ERROR",
            BankError::StorageTimeout(_) => "STORAGE_TIMEOUT",
            BankError::AuditTrailDiverged { .. } => "AUDIT_TRAIL_DIVERGED",
            BankError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, BankError>;
