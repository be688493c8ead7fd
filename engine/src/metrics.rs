//! Operational counters for the ledger engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bankcore_common::BankError;
use serde::Serialize;

/// Engine metrics.
pub struct Metrics {
    /// Accounts opened.
    pub accounts_created: AtomicU64,
    /// Transfers attempted.
    pub transfers_total: AtomicU64,
    /// Transfers committed.
    pub transfers_success: AtomicU64,
    /// Transfers rejected before any money moved.
    pub transfers_rejected: AtomicU64,
    /// Committed direct balance updates.
    pub balance_updates: AtomicU64,
    /// Operations rejected for insufficient funds.
    pub insufficient_funds: AtomicU64,
    /// Storage faults, timeouts included.
    pub storage_faults: AtomicU64,
    /// Storage calls that hit their deadline.
    pub storage_timeouts: AtomicU64,
    /// Committed mutations whose entry could not be written.
    pub audit_divergences: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            accounts_created: AtomicU64::new(0),
            transfers_total: AtomicU64::new(0),
            transfers_success: AtomicU64::new(0),
            transfers_rejected: AtomicU64::new(0),
            balance_updates: AtomicU64::new(0),
            insufficient_funds: AtomicU64::new(0),
            storage_faults: AtomicU64::new(0),
            storage_timeouts: AtomicU64::new(0),
            audit_divergences: AtomicU64::new(0),
        }
    }

    pub fn account_created(&self) {
        self.accounts_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_initiated(&self) {
        self.transfers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_success(&self) {
        self.transfers_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transfer that failed, classifying the cause.
    pub fn transfer_failed(&self, error: &BankError) {
        if !error.money_moved() {
            self.transfers_rejected.fetch_add(1, Ordering::Relaxed);
        }
        self.record_error(error);
    }

    pub fn balance_updated(&self) {
        self.balance_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump the counter matching an error's class.
    pub fn record_error(&self, error: &BankError) {
        match error {
            BankError::InsufficientFunds { .. } => {
                self.insufficient_funds.fetch_add(1, Ordering::Relaxed);
            }
            BankError::StorageTimeout(_) => {
                self.storage_timeouts.fetch_add(1, Ordering::Relaxed);
                self.storage_faults.fetch_add(1, Ordering::Relaxed);
            }
            BankError::Storage(_) => {
                self.storage_faults.fetch_add(1, Ordering::Relaxed);
            }
            BankError::AuditTrailDiverged { .. } => {
                self.audit_divergences.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accounts_created: self.accounts_created.load(Ordering::Relaxed),
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfers_success: self.transfers_success.load(Ordering::Relaxed),
            transfers_rejected: self.transfers_rejected.load(Ordering::Relaxed),
            balance_updates: self.balance_updates.load(Ordering::Relaxed),
            insufficient_funds: self.insufficient_funds.load(Ordering::Relaxed),
            storage_faults: self.storage_faults.load(Ordering::Relaxed),
            storage_timeouts: self.storage_timeouts.load(Ordering::Relaxed),
            audit_divergences: self.audit_divergences.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub accounts_created: u64,
    pub transfers_total: u64,
    pub transfers_success: u64,
    pub transfers_rejected: u64,
    pub balance_updates: u64,
    pub insufficient_funds: u64,
    pub storage_faults: u64,
    pub storage_timeouts: u64,
    pub audit_divergences: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
