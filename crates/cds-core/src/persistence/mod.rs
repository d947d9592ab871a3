//! Persistence interfaces and backends for cds-core.
//!
//! All reads and writes go through a [`UnitOfWork`]: one database
//! transaction that is committed explicitly and rolled back when dropped.
//! [`with_transaction`] wraps a closure in a unit of work and guarantees
//! commit-or-rollback on every exit path.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresRunStore;
pub use self::sqlite::SqliteRunStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{
    ConcurrencyObject, ConcurrencyScope, ConcurrencyScopeKey, JobDefinition, JobStatus,
    ProjectRunRetention, RunStatus, WorkflowConcurrency, WorkflowRef, WorkflowRun,
    WorkflowRunData, WorkflowRunInfo, WorkflowRunJob,
};

/// Handle on a database that hands out units of work.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Open a new transaction.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// Check that the database answers.
    async fn health_check(&self) -> Result<bool>;
}

/// Queries executed inside one transaction.
///
/// Dropping a unit of work without calling [`commit`](UnitOfWork::commit)
/// rolls it back.
#[allow(missing_docs)]
#[async_trait]
pub trait UnitOfWork: Send {
    // ------------------------------------------------------------------
    // Workflow runs
    // ------------------------------------------------------------------

    /// Insert a run. The store assigns `seq`.
    async fn insert_run(&mut self, run: &WorkflowRun) -> Result<()>;

    async fn get_run(&mut self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Set the run status and bump `last_modified` to `at`.
    async fn update_run_status(
        &mut self,
        run_id: &str,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Attach (or detach) the resolved concurrency rule of a run.
    async fn set_run_concurrency(
        &mut self,
        run_id: &str,
        rule: Option<&WorkflowConcurrency>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Job runs
    // ------------------------------------------------------------------

    /// Insert a job run. The store assigns `seq`.
    async fn insert_run_job(&mut self, job: &WorkflowRunJob) -> Result<()>;

    async fn get_run_job(&mut self, job_id: &str) -> Result<Option<WorkflowRunJob>>;

    /// Job runs of a run, in insertion order.
    async fn list_run_jobs(&mut self, run_id: &str) -> Result<Vec<WorkflowRunJob>>;

    /// Set the job status; `started`/`ended` are stamped with `at` on the
    /// first transition into `Building`/a terminated status.
    async fn update_run_job_status(
        &mut self,
        job_id: &str,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Attach (or detach) the resolved concurrency rule of a job run.
    async fn set_run_job_concurrency(
        &mut self,
        job_id: &str,
        rule: Option<&WorkflowConcurrency>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Run infos
    // ------------------------------------------------------------------

    async fn insert_run_info(&mut self, info: &WorkflowRunInfo) -> Result<()>;

    /// Infos of a run, oldest first.
    async fn list_run_infos(&mut self, run_id: &str) -> Result<Vec<WorkflowRunInfo>>;

    // ------------------------------------------------------------------
    // Project concurrency definitions
    // ------------------------------------------------------------------

    /// Create or replace a project-level rule definition.
    async fn upsert_project_concurrency(
        &mut self,
        project_key: &str,
        rule: &WorkflowConcurrency,
    ) -> Result<()>;

    /// Project-level rule definitions, by name.
    async fn load_project_concurrencies(
        &mut self,
        project_key: &str,
    ) -> Result<Vec<WorkflowConcurrency>>;

    // ------------------------------------------------------------------
    // Concurrency bookkeeping
    // ------------------------------------------------------------------

    /// Serialize admission decisions for the rule group of `key`.
    ///
    /// Held until the unit of work ends. Must be taken before
    /// [`load_concurrency_objects`](UnitOfWork::load_concurrency_objects)
    /// whenever the caller writes statuses based on what it loaded.
    async fn lock_concurrency_group(&mut self, key: &ConcurrencyScopeKey) -> Result<()>;

    /// Building and blocked runs and job runs sharing the rule of `key`.
    ///
    /// Runs come first, then jobs, each in insertion order.
    async fn load_concurrency_objects(
        &mut self,
        key: &ConcurrencyScopeKey,
    ) -> Result<Vec<ConcurrencyObject>>;

    /// Distinct rule groups that hold at least one blocked object, in key
    /// order, starting strictly after `after`.
    async fn list_blocked_concurrency_groups(
        &mut self,
        after: Option<&ConcurrencyScopeKey>,
        limit: i64,
    ) -> Result<Vec<ConcurrencyScopeKey>>;

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Create or replace the run retention policy of a project.
    async fn upsert_project_run_retention(&mut self, retention: &ProjectRunRetention)
    -> Result<()>;

    async fn load_project_run_retention(
        &mut self,
        project_key: &str,
    ) -> Result<Option<ProjectRunRetention>>;

    /// Projects owning at least one run.
    async fn list_run_project_keys(&mut self) -> Result<Vec<String>>;

    /// Distinct (workflow, git ref) pairs of the runs of a project.
    async fn list_run_workflow_refs(
        &mut self,
        project_key: &str,
    ) -> Result<Vec<(WorkflowRef, String)>>;

    /// Ids of terminated runs of a workflow and git ref last modified
    /// before `cutoff`, oldest first.
    async fn list_terminated_runs_older_than(
        &mut self,
        project_key: &str,
        workflow: &WorkflowRef,
        git_ref: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Ids of terminated runs of a workflow and git ref that come after
    /// the `keep` most recent runs (by run number), whatever their status.
    async fn list_terminated_runs_beyond(
        &mut self,
        project_key: &str,
        workflow: &WorkflowRef,
        git_ref: &str,
        keep: i64,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Delete runs with their job runs and infos. Returns the number of runs deleted.
    async fn delete_runs(&mut self, run_ids: &[String]) -> Result<u64>;

    // ------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `f` inside a unit of work.
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`. If the
/// future is dropped or panics the transaction is rolled back on drop.
///
/// ```ignore
/// let run = with_transaction(store.as_ref(), move |uow| {
///     Box::pin(async move { uow.get_run(&run_id).await })
/// })
/// .await?;
/// ```
pub async fn with_transaction<T, E, F>(store: &dyn RunStore, f: F) -> std::result::Result<T, E>
where
    E: From<Error>,
    F: for<'a> FnOnce(&'a mut dyn UnitOfWork) -> BoxFuture<'a, std::result::Result<T, E>>,
{
    let mut uow = store.begin().await?;
    match f(uow.as_mut()).await {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "Failed to roll back transaction");
            }
            Err(e)
        }
    }
}

// ============================================================================
// Row types shared by the backends
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunRow {
    seq: i64,
    id: String,
    project_key: String,
    vcs_server: String,
    repository: String,
    workflow_name: String,
    run_number: i64,
    run_attempt: i64,
    status: String,
    started: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    username: String,
    workflow_data: String,
    concurrency: Option<String>,
    git_ref: String,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            seq: row.seq,
            id: row.id,
            project_key: row.project_key,
            vcs_server: row.vcs_server,
            repository: row.repository,
            workflow_name: row.workflow_name,
            git_ref: row.git_ref,
            run_number: row.run_number,
            run_attempt: row.run_attempt,
            status: row.status.parse()?,
            started: row.started,
            last_modified: row.last_modified,
            username: row.username,
            workflow_data: serde_json::from_str::<WorkflowRunData>(&row.workflow_data)?,
            concurrency: decode_rule(row.concurrency.as_deref())?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunJobRow {
    seq: i64,
    id: String,
    workflow_run_id: String,
    job_id: String,
    project_key: String,
    vcs_server: String,
    repository: String,
    workflow_name: String,
    run_number: i64,
    run_attempt: i64,
    status: String,
    queued: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
    initiator: String,
    job: String,
    concurrency: Option<String>,
}

impl TryFrom<RunJobRow> for WorkflowRunJob {
    type Error = Error;

    fn try_from(row: RunJobRow) -> Result<Self> {
        Ok(Self {
            seq: row.seq,
            id: row.id,
            workflow_run_id: row.workflow_run_id,
            job_id: row.job_id,
            project_key: row.project_key,
            vcs_server: row.vcs_server,
            repository: row.repository,
            workflow_name: row.workflow_name,
            run_number: row.run_number,
            run_attempt: row.run_attempt,
            status: row.status.parse()?,
            queued: row.queued,
            started: row.started,
            ended: row.ended,
            initiator: row.initiator,
            job: serde_json::from_str::<JobDefinition>(&row.job)?,
            concurrency: decode_rule(row.concurrency.as_deref())?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunInfoRow {
    id: i64,
    workflow_run_id: String,
    issued_at: DateTime<Utc>,
    level: String,
    message: String,
}

impl TryFrom<RunInfoRow> for WorkflowRunInfo {
    type Error = Error;

    fn try_from(row: RunInfoRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workflow_run_id: row.workflow_run_id,
            issued_at: row.issued_at,
            level: row.level.parse()?,
            message: row.message,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ConcurrencyGroupRow {
    project_key: String,
    vcs_server: String,
    repository: String,
    workflow_name: String,
    concurrency_name: String,
    concurrency_scope: String,
}

impl TryFrom<ConcurrencyGroupRow> for ConcurrencyScopeKey {
    type Error = Error;

    fn try_from(row: ConcurrencyGroupRow) -> Result<Self> {
        Ok(match row.concurrency_scope.parse::<ConcurrencyScope>()? {
            ConcurrencyScope::Workflow => ConcurrencyScopeKey::workflow(
                row.project_key,
                WorkflowRef::new(row.vcs_server, row.repository, row.workflow_name),
                row.concurrency_name,
            ),
            ConcurrencyScope::Project => {
                ConcurrencyScopeKey::project(row.project_key, row.concurrency_name)
            }
        })
    }
}

/// Collapse group rows into distinct sorted keys greater than `after`,
/// keeping at most `limit`.
pub(crate) fn distinct_groups(
    rows: Vec<ConcurrencyGroupRow>,
    after: Option<&ConcurrencyScopeKey>,
    limit: i64,
) -> Result<Vec<ConcurrencyScopeKey>> {
    let mut keys = std::collections::BTreeSet::new();
    for row in rows {
        let key = ConcurrencyScopeKey::try_from(row)?;
        if after.is_none_or(|after| &key > after) {
            keys.insert(key);
        }
    }
    Ok(keys.into_iter().take(limit.max(0) as usize).collect())
}

/// Columns bound for a rule: (json, name, scope).
pub(crate) fn encode_rule(
    rule: Option<&WorkflowConcurrency>,
) -> Result<(Option<String>, Option<String>, Option<String>)> {
    match rule {
        Some(rule) => Ok((
            Some(serde_json::to_string(rule)?),
            Some(rule.name.clone()),
            Some(rule.scope.as_str().to_string()),
        )),
        None => Ok((None, None, None)),
    }
}

fn decode_rule(raw: Option<&str>) -> Result<Option<WorkflowConcurrency>> {
    raw.map(serde_json::from_str::<WorkflowConcurrency>)
        .transpose()
        .map_err(Error::from)
}

/// Workflow filter bound for a scope key: (is_project, vcs, repo, workflow).
pub(crate) fn scope_binds(key: &ConcurrencyScopeKey) -> (bool, &str, &str, &str) {
    match &key.workflow {
        Some(wf) => (
            false,
            wf.vcs_server.as_str(),
            wf.repository.as_str(),
            wf.workflow_name.as_str(),
        ),
        None => (true, "", "", ""),
    }
}

/// `started`/`ended` stamps for a job status transition.
pub(crate) fn job_stamps(
    status: JobStatus,
    at: DateTime<Utc>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let started = (status == JobStatus::Building).then_some(at);
    let ended = status.is_terminated().then_some(at);
    (started, ended)
}
