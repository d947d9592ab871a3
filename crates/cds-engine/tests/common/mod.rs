// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cds-engine integration tests.
//!
//! Provides a SQLite-backed store and builders for runs and job runs with
//! controlled timestamps.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use cds_core::persistence::{RunStore, SqliteRunStore};
use cds_core::types::{
    ConcurrencyOrder, ConcurrencyScope, JobDefinition, JobStatus, RunStatus, WorkflowConcurrency,
    WorkflowRef, WorkflowRun, WorkflowRunJob,
};

pub const PROJECT: &str = "PROJ";

/// A fresh in-memory store with migrations applied.
pub async fn sqlite_store() -> Arc<dyn RunStore> {
    Arc::new(
        SqliteRunStore::in_memory()
            .await
            .expect("Failed to create in-memory store"),
    )
}

/// A store backed by a fresh database file, allowing concurrent connections.
///
/// Returns the file path so the caller can remove it.
pub async fn file_sqlite_store(max_connections: u32) -> (Arc<dyn RunStore>, PathBuf) {
    let path = std::env::temp_dir().join(format!("cds-engine-{}.db", uuid::Uuid::new_v4()));
    let store = SqliteRunStore::from_path(&path, max_connections)
        .await
        .expect("Failed to create file store");
    (Arc::new(store), path)
}

pub fn workflow(name: &str) -> WorkflowRef {
    WorkflowRef::new("github", "ovh/cds", name)
}

/// Fixed base instant; `at(n)` is `n` minutes after it.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .expect("valid base timestamp")
        + Duration::minutes(minutes)
}

pub fn rule(
    name: &str,
    pool: i64,
    order: ConcurrencyOrder,
    cancel_in_progress: bool,
    scope: ConcurrencyScope,
) -> WorkflowConcurrency {
    WorkflowConcurrency {
        name: name.to_string(),
        order,
        pool,
        cancel_in_progress,
        scope,
        if_condition: None,
    }
}

/// A run of `wf` with the given status, timestamp and applied rule.
pub fn run_at(
    wf: &WorkflowRef,
    number: i64,
    status: RunStatus,
    minutes: i64,
    rule: Option<&WorkflowConcurrency>,
) -> WorkflowRun {
    let mut run = WorkflowRun::new(PROJECT, wf, number, "admin");
    run.status = status;
    run.started = at(minutes);
    run.last_modified = at(minutes);
    run.concurrency = rule.cloned();
    if let Some(rule) = rule {
        run.workflow_data.concurrency = Some(rule.name.clone());
    }
    run
}

/// A job run of `parent` with the given status, queue time and applied rule.
pub fn job_at(
    parent: &WorkflowRun,
    job_id: &str,
    status: JobStatus,
    minutes: i64,
    rule: Option<&WorkflowConcurrency>,
) -> WorkflowRunJob {
    let mut job = WorkflowRunJob::for_run(
        parent,
        job_id,
        JobDefinition {
            name: Some(job_id.to_string()),
            concurrency: rule.map(|r| r.name.clone()),
        },
    );
    job.status = status;
    job.queued = at(minutes);
    job.concurrency = rule.cloned();
    job
}

pub async fn insert_runs(store: &dyn RunStore, runs: &[&WorkflowRun]) {
    let mut uow = store.begin().await.expect("begin");
    for run in runs {
        uow.insert_run(run).await.expect("insert run");
    }
    uow.commit().await.expect("commit");
}

pub async fn insert_jobs(store: &dyn RunStore, jobs: &[&WorkflowRunJob]) {
    let mut uow = store.begin().await.expect("begin");
    for job in jobs {
        uow.insert_run_job(job).await.expect("insert job");
    }
    uow.commit().await.expect("commit");
}

pub async fn run_status(store: &dyn RunStore, run_id: &str) -> RunStatus {
    let mut uow = store.begin().await.expect("begin");
    uow.get_run(run_id)
        .await
        .expect("get run")
        .expect("run exists")
        .status
}

pub async fn job_status(store: &dyn RunStore, job_id: &str) -> JobStatus {
    let mut uow = store.begin().await.expect("begin");
    uow.get_run_job(job_id)
        .await
        .expect("get job")
        .expect("job exists")
        .status
}
