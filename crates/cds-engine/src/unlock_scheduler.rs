// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unlock scheduler.
//!
//! Periodically lists the rule groups that still hold blocked runs or jobs
//! and re-applies admission to each of them. Releases normally happen when
//! an object finishes; this loop picks up the ones that were missed, for
//! example across an engine restart.
//!
//! Groups are visited in key order, one batch per poll. A cursor carries
//! the last visited key to the next poll and wraps around at the end, so
//! every group is reached even when more than a batch stay blocked.

use std::sync::Arc;
use std::time::Duration;

use cds_core::types::ConcurrencyScopeKey;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::run_engine::RunEngine;

/// Unlock scheduler configuration.
#[derive(Debug, Clone)]
pub struct UnlockSchedulerConfig {
    /// How often to poll for blocked rule groups
    pub poll_interval: Duration,
    /// Maximum rule groups to process per poll
    pub batch_size: i64,
}

impl Default for UnlockSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
        }
    }
}

/// Unlock scheduler that runs as a background task.
pub struct UnlockScheduler {
    engine: RunEngine,
    config: UnlockSchedulerConfig,
    shutdown: Arc<Notify>,
    cursor: Mutex<Option<ConcurrencyScopeKey>>,
}

impl UnlockScheduler {
    /// Create a new unlock scheduler.
    pub fn new(engine: RunEngine, config: UnlockSchedulerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
            cursor: Mutex::new(None),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop until the shutdown signal is received.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Unlock scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Unlock scheduler shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_blocked_groups().await {
                        error!(error = %e, "Failed to process blocked concurrency groups");
                    }
                }
            }
        }
    }

    /// Re-apply admission to the next batch of blocked rule groups. Returns
    /// the number of objects unlocked.
    pub async fn process_blocked_groups(&self) -> Result<usize> {
        let mut cursor = self.cursor.lock().await;
        let groups = {
            let mut uow = self.engine.store().begin().await?;
            let mut groups = uow
                .list_blocked_concurrency_groups(cursor.as_ref(), self.config.batch_size)
                .await?;
            if groups.is_empty() && cursor.is_some() {
                // Past the last group: start over.
                groups = uow
                    .list_blocked_concurrency_groups(None, self.config.batch_size)
                    .await?;
            }
            uow.commit().await?;
            groups
        };

        *cursor = if groups.len() as i64 >= self.config.batch_size {
            groups.last().cloned()
        } else {
            None
        };
        drop(cursor);

        if groups.is_empty() {
            debug!("No blocked concurrency groups");
            return Ok(0);
        }

        debug!(count = groups.len(), "Processing blocked concurrency groups");

        let mut unlocked = 0;
        for key in &groups {
            match self.engine.unlock_group(key).await {
                Ok(applied) => {
                    if !applied.unlocked.is_empty() || !applied.cancelled.is_empty() {
                        info!(
                            rule = %key,
                            unlocked = applied.unlocked.len(),
                            cancelled = applied.cancelled.len(),
                            "Unlocked blocked objects"
                        );
                    }
                    unlocked += applied.unlocked.len();
                }
                Err(e) => {
                    error!(rule = %key, error = %e, "Failed to unlock concurrency group");
                }
            }
        }

        Ok(unlocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cds_core::persistence::SqliteRunStore;
    use cds_core::types::{RunStatus, WorkflowConcurrency, WorkflowRef, WorkflowRun};
    use chrono::Utc;

    #[test]
    fn test_default_config() {
        let config = UnlockSchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 50);
    }

    #[tokio::test]
    async fn test_process_unlocks_stranded_run() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let engine = RunEngine::new(Arc::new(store));

        // A blocked run whose pool is free: the release was never delivered.
        let mut run = WorkflowRun::new("PROJ", &WorkflowRef::new("github", "ovh/cds", "build"), 1, "admin");
        run.status = RunStatus::Blocked;
        run.concurrency = Some(WorkflowConcurrency::new("deploy"));
        {
            let mut uow = engine.store().begin().await.unwrap();
            uow.insert_run(&run).await.unwrap();
            uow.commit().await.unwrap();
        }

        let scheduler = UnlockScheduler::new(engine.clone(), UnlockSchedulerConfig::default());
        assert_eq!(scheduler.process_blocked_groups().await.unwrap(), 1);
        assert_eq!(scheduler.process_blocked_groups().await.unwrap(), 0);

        let mut uow = engine.store().begin().await.unwrap();
        let loaded = uow.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Building);
        assert!(loaded.last_modified >= run.last_modified);
        assert!(loaded.last_modified <= Utc::now());
    }

    #[tokio::test]
    async fn test_cursor_reaches_groups_beyond_first_batch() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let engine = RunEngine::new(Arc::new(store));
        let wf = WorkflowRef::new("github", "ovh/cds", "build");

        let mut holder = WorkflowRun::new("PROJ", &wf, 1, "admin");
        holder.status = RunStatus::Building;
        holder.concurrency = Some(WorkflowConcurrency::new("a-full"));
        let mut waiting = WorkflowRun::new("PROJ", &wf, 2, "admin");
        waiting.status = RunStatus::Blocked;
        waiting.concurrency = Some(WorkflowConcurrency::new("a-full"));
        let mut stranded = WorkflowRun::new("PROJ", &wf, 3, "admin");
        stranded.status = RunStatus::Blocked;
        stranded.concurrency = Some(WorkflowConcurrency::new("b-stranded"));
        {
            let mut uow = engine.store().begin().await.unwrap();
            for run in [&holder, &waiting, &stranded] {
                uow.insert_run(run).await.unwrap();
            }
            uow.commit().await.unwrap();
        }

        let scheduler = UnlockScheduler::new(
            engine.clone(),
            UnlockSchedulerConfig {
                poll_interval: Duration::from_secs(5),
                batch_size: 1,
            },
        );
        let mut unlocked = 0;
        for _ in 0..3 {
            unlocked += scheduler.process_blocked_groups().await.unwrap();
        }
        assert_eq!(unlocked, 1);

        let mut uow = engine.store().begin().await.unwrap();
        let stranded = uow.get_run(&stranded.id).await.unwrap().unwrap();
        let waiting = uow.get_run(&waiting.id).await.unwrap().unwrap();
        assert_eq!(stranded.status, RunStatus::Building);
        assert_eq!(waiting.status, RunStatus::Blocked);
    }

    #[tokio::test]
    async fn test_cursor_wraps_around() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let engine = RunEngine::new(Arc::new(store));
        let wf = WorkflowRef::new("github", "ovh/cds", "build");

        let mut holder = WorkflowRun::new("PROJ", &wf, 1, "admin");
        holder.status = RunStatus::Building;
        holder.concurrency = Some(WorkflowConcurrency::new("deploy"));
        let mut waiting = WorkflowRun::new("PROJ", &wf, 2, "admin");
        waiting.status = RunStatus::Blocked;
        waiting.concurrency = Some(WorkflowConcurrency::new("deploy"));
        {
            let mut uow = engine.store().begin().await.unwrap();
            uow.insert_run(&holder).await.unwrap();
            uow.insert_run(&waiting).await.unwrap();
            uow.commit().await.unwrap();
        }

        let scheduler = UnlockScheduler::new(
            engine.clone(),
            UnlockSchedulerConfig {
                poll_interval: Duration::from_secs(5),
                batch_size: 1,
            },
        );
        assert_eq!(scheduler.process_blocked_groups().await.unwrap(), 0);

        {
            let mut uow = engine.store().begin().await.unwrap();
            uow.update_run_status(&holder.id, RunStatus::Success, Utc::now())
                .await
                .unwrap();
            uow.commit().await.unwrap();
        }

        // The cursor sits on the only group; the next poll starts over.
        assert_eq!(scheduler.process_blocked_groups().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let engine = RunEngine::new(Arc::new(store));
        let scheduler = UnlockScheduler::new(
            engine,
            UnlockSchedulerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
            },
        );
        let shutdown = scheduler.shutdown_handle();
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();
        handle.await.unwrap();
    }
}
