//! BankCore Engine
//!
//! The ledger consistency core: direct balance updates, transfers between
//! accounts and the read paths over them, all behind the [`Bank`] facade.
//! Atomicity comes from the ledger store; this crate owns validation,
//! ownership checks, audit recording and the storage deadline.

pub mod bank;
pub mod config;
pub mod deadline;
pub mod metrics;
pub mod mutator;
pub mod query;
pub mod transfer;

pub use bank::Bank;
pub use config::{EngineConfig, StoreBackend};
pub use deadline::TimedStore;
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use mutator::BalanceMutator;
pub use query::{QueryService, Reconciliation};
pub use transfer::{TransferEngine, TransferReceipt};
