//! BankCore Common Types
//!
//! This crate contains shared types used across the ledger core,
//! including identifiers, currencies, and the error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
pub use time::*;
