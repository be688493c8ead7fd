//! BankCore Ledger
//!
//! Accounts, the append-only ledger of entries and the store contract that
//! makes balance changes atomic, with in-memory and PostgreSQL backends.

pub mod account;
pub mod config;
pub mod journal;
pub mod memory;
pub mod postgres;
pub mod store;

pub use account::Account;
pub use config::DatabaseConfig;
pub use journal::{EntryStatus, EntryType, LedgerEntry, TransferLegs};
pub use memory::{MemoryStore, StoreFaults};
pub use postgres::PgLedgerStore;
pub use store::{lock_order, LedgerStore};
