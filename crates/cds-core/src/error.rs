// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cds-core.

use thiserror::Error;

/// Result type using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the model and the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON column could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored value does not map to a known enum variant.
    #[error("Invalid value for '{field}': '{value}'")]
    InvalidValue {
        /// Column or field name.
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// Workflow run was not found.
    #[error("Workflow run '{0}' not found")]
    RunNotFound(String),

    /// Job run was not found.
    #[error("Job run '{0}' not found")]
    RunJobNotFound(String),
}

impl Error {
    /// Get a stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migrate(_) => "MIGRATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::RunJobNotFound(_) => "RUN_JOB_NOT_FOUND",
        }
    }
}
