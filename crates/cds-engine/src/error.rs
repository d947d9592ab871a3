// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cds-engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Persistence or model conversion failed.
    #[error("Core error: {0}")]
    Core(#[from] cds_core::Error),

    /// The engine trigger channel is closed.
    #[error("Run engine is not running")]
    EngineStopped,

    /// A retention policy holds an invalid glob pattern.
    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The pattern as written in the policy.
        pattern: String,
        /// Why it does not parse.
        #[source]
        source: glob::PatternError,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
