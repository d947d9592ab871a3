// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CDS Engine - Workflow Run Admission Server
//!
//! Runs the run engine queue together with:
//! - The unlock scheduler (re-checks blocked concurrency groups)
//! - The retention worker (deletes old terminated runs, when enabled)

use std::sync::Arc;
use tracing::{info, warn};

use cds_core::persistence::{PostgresRunStore, RunStore, SqliteRunStore};
use cds_engine::config::Config;
use cds_engine::retention_worker::RetentionWorkerConfig;
use cds_engine::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cds_engine=info,cds_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        sqlite = config.is_sqlite(),
        max_connections = config.database_max_connections,
        "Starting CDS Engine"
    );

    // Migrations run as part of connect
    let store: Arc<dyn RunStore> = if config.is_sqlite() {
        Arc::new(
            SqliteRunStore::connect(&config.database_url, config.database_max_connections).await?,
        )
    } else {
        Arc::new(
            PostgresRunStore::connect(&config.database_url, config.database_max_connections)
                .await?,
        )
    };

    info!("Connected to database");

    let runtime = EngineRuntime::builder()
        .store(store)
        .unlock_poll_interval(config.unlock_poll_interval)
        .unlock_batch_size(config.unlock_batch_size)
        .retention_config(RetentionWorkerConfig::from_env())
        .build()?
        .start()
        .await?;

    info!("CDS Engine ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("CDS Engine shut down");

    Ok(())
}
