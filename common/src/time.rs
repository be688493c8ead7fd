//! Time utilities and constants for the ledger.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Timing constants.
pub mod constants {
    use super::Duration;

    /// Default deadline for a single storage operation (5 seconds).
    pub fn default_storage_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// Database connect timeout (10 seconds).
    pub fn connect_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Maximum pooled connection lifetime (1 hour).
    pub fn max_connection_lifetime() -> Duration {
        Duration::from_secs(60 * 60)
    }

    /// Maximum pooled connection idle time (30 minutes).
    pub fn max_connection_idle() -> Duration {
        Duration::from_secs(30 * 60)
    }
}

/// A timestamp (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}
