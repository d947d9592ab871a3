// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for cds-engine.

use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (`postgres://...` or `sqlite:...`)
    pub database_url: String,
    /// Maximum pool connections
    pub database_max_connections: u32,
    /// How often the unlock scheduler re-checks blocked rule groups
    pub unlock_poll_interval: Duration,
    /// Maximum rule groups re-checked per poll
    pub unlock_batch_size: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CDS_DATABASE_URL` (required)
    /// - `CDS_DATABASE_MAX_CONNECTIONS` (default: 10)
    /// - `CDS_UNLOCK_POLL_INTERVAL_SECS` (default: 5)
    /// - `CDS_UNLOCK_BATCH_SIZE` (default: 50)
    ///
    /// Retention settings are read by
    /// [`RetentionWorkerConfig::from_env`](crate::retention_worker::RetentionWorkerConfig::from_env).
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CDS_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CDS_DATABASE_URL"))?;

        if !database_url.starts_with("postgres") && !database_url.starts_with("sqlite:") {
            return Err(ConfigError::UnsupportedDatabase(database_url));
        }

        let database_max_connections = parse_var("CDS_DATABASE_MAX_CONNECTIONS", 10)?;
        let unlock_poll_interval_secs = parse_var("CDS_UNLOCK_POLL_INTERVAL_SECS", 5)?;
        let unlock_batch_size = parse_var("CDS_UNLOCK_BATCH_SIZE", 50)?;

        Ok(Self {
            database_url,
            database_max_connections,
            unlock_poll_interval: Duration::from_secs(unlock_poll_interval_secs),
            unlock_batch_size,
        })
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A numeric variable could not be parsed.
    #[error("Invalid number in environment variable {0}")]
    InvalidNumber(&'static str),
    /// The database URL scheme is not supported.
    #[error("Unsupported database URL: {0} (expected postgres:// or sqlite:)")]
    UnsupportedDatabase(String),
}
