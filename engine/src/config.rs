//! Engine configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bankcore_common::time::constants;
use bankcore_ledger::DatabaseConfig;
use serde::{Deserialize, Serialize};

/// Which ledger store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; state is lost on exit.
    Memory,
    /// PostgreSQL via a connection pool.
    Postgres,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Postgres => write!(f, "postgres"),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            other => Err(format!("unknown ledger backend: {other}")),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for each individual storage call.
    pub storage_timeout: Duration,
    /// Ledger store backend.
    pub backend: StoreBackend,
    /// Database settings, used by the PostgreSQL backend.
    pub database: DatabaseConfig,
    /// Apply embedded migrations on startup.
    pub run_migrations: bool,
    /// Log level.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_timeout: constants::default_storage_timeout(),
            backend: StoreBackend::Memory,
            database: DatabaseConfig::default(),
            run_migrations: true,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(backend) = std::env::var("LEDGER_BACKEND") {
            if let Ok(backend) = backend.parse() {
                config.backend = backend;
            }
        }

        if let Ok(ms) = std::env::var("STORAGE_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.storage_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(flag) = std::env::var("RUN_MIGRATIONS") {
            config.run_migrations = !matches!(flag.as_str(), "0" | "false" | "no");
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config.database = DatabaseConfig::from_env();
        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.storage_timeout.is_zero() {
            return Err("Storage timeout cannot be 0".to_string());
        }

        if self.backend == StoreBackend::Postgres {
            self.database.validate()?;
        }

        Ok(())
    }
}
