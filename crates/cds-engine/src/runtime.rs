// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cds-engine.
//!
//! [`EngineRuntime`] runs the run engine queue, the unlock scheduler and the
//! retention worker inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cds_core::persistence::PostgresRunStore;
//! use cds_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = PostgresRunStore::connect("postgres://...", 10).await?;
//!
//!     let runtime = EngineRuntime::builder()
//!         .store(Arc::new(store))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.trigger().enqueue_run(run_id).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cds_core::persistence::RunStore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::retention_worker::{RetentionWorker, RetentionWorkerConfig};
use crate::run_engine::{RunEngine, RunTrigger};
use crate::unlock_scheduler::{UnlockScheduler, UnlockSchedulerConfig};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn RunStore>>,
    queue_capacity: usize,
    unlock_poll_interval: Duration,
    unlock_batch_size: i64,
    retention_config: RetentionWorkerConfig,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            queue_capacity: 256,
            unlock_poll_interval: Duration::from_secs(5),
            unlock_batch_size: 50,
            retention_config: RetentionWorkerConfig::from_env(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run store (required).
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the capacity of the engine queue.
    ///
    /// Default: 256
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the unlock scheduler poll interval.
    ///
    /// Default: 5 seconds
    pub fn unlock_poll_interval(mut self, interval: Duration) -> Self {
        self.unlock_poll_interval = interval;
        self
    }

    /// Set the unlock scheduler batch size.
    ///
    /// Default: 50
    pub fn unlock_batch_size(mut self, size: i64) -> Self {
        self.unlock_batch_size = size;
        self
    }

    /// Set the retention worker configuration.
    ///
    /// Default: Loaded from environment variables via [`RetentionWorkerConfig::from_env()`].
    pub fn retention_config(mut self, config: RetentionWorkerConfig) -> Self {
        self.retention_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than zero");
        }

        Ok(EngineRuntimeConfig {
            store,
            queue_capacity: self.queue_capacity,
            unlock_config: UnlockSchedulerConfig {
                poll_interval: self.unlock_poll_interval,
                batch_size: self.unlock_batch_size,
            },
            retention_config: self.retention_config,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    store: Arc<dyn RunStore>,
    queue_capacity: usize,
    unlock_config: UnlockSchedulerConfig,
    retention_config: RetentionWorkerConfig,
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the engine loop and the background workers.
    pub async fn start(self) -> Result<EngineRuntime> {
        match self.store.health_check().await {
            Ok(true) => {}
            Ok(false) => warn!("Run store health check returned false"),
            Err(e) => return Err(e.into()),
        }

        let engine = RunEngine::new(self.store.clone());
        let (trigger, receiver) = RunTrigger::channel(self.queue_capacity);

        let engine_shutdown = engine.shutdown_handle();
        let engine_worker = engine.clone();
        let engine_handle = tokio::spawn(async move {
            engine_worker.run(receiver).await;
        });

        let unlock_scheduler = UnlockScheduler::new(engine.clone(), self.unlock_config.clone());
        let unlock_shutdown = unlock_scheduler.shutdown_handle();
        let unlock_handle = tokio::spawn(unlock_scheduler.run());

        let retention_worker = RetentionWorker::new(self.store.clone(), self.retention_config);
        let retention_shutdown = retention_worker.shutdown_handle();
        let retention_handle = tokio::spawn(async move {
            retention_worker.run().await;
        });

        info!(
            queue_capacity = self.queue_capacity,
            unlock_poll_interval_ms = self.unlock_config.poll_interval.as_millis() as u64,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            engine,
            trigger,
            engine_handle,
            unlock_handle,
            retention_handle,
            engine_shutdown,
            unlock_shutdown,
            retention_shutdown,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// The runtime manages:
/// - The run engine loop consuming [`RunTrigger`] items
/// - The unlock scheduler re-checking blocked rule groups
/// - The retention worker deleting old terminated runs
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    engine: RunEngine,
    trigger: RunTrigger,
    engine_handle: JoinHandle<()>,
    unlock_handle: JoinHandle<()>,
    retention_handle: JoinHandle<()>,
    engine_shutdown: Arc<Notify>,
    unlock_shutdown: Arc<Notify>,
    retention_shutdown: Arc<Notify>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Handle for queueing runs, jobs and releases.
    pub fn trigger(&self) -> &RunTrigger {
        &self.trigger
    }

    /// The engine, for callers that need the enqueue outcome.
    pub fn engine(&self) -> &RunEngine {
        &self.engine
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the engine loop and the workers to stop, then waits for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.engine_shutdown.notify_one();
        self.unlock_shutdown.notify_one();
        self.retention_shutdown.notify_one();

        let mut failed = false;

        if let Err(e) = self.engine_handle.await {
            error!("Run engine task panicked: {}", e);
            failed = true;
        }

        if let Err(e) = self.unlock_handle.await {
            error!("Unlock scheduler task panicked: {}", e);
            failed = true;
        }

        if let Err(e) = self.retention_handle.await {
            error!("Retention worker task panicked: {}", e);
            failed = true;
        }

        if failed {
            anyhow::bail!("one or more engine tasks panicked");
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.engine_handle.is_finished() && !self.unlock_handle.is_finished()
    }
}
