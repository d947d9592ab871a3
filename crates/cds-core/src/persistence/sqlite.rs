//! SQLite-backed persistence implementation.
//!
//! SQLite has no row or advisory locks. Every unit of work starts with
//! `BEGIN IMMEDIATE`, taking the database write lock up front, so two
//! admission decisions never interleave their reads and writes.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::error::{Error, Result};
use crate::migrations;
use crate::types::{
    ConcurrencyObject, ConcurrencyScopeKey, JobStatus, ProjectRunRetention, RunStatus,
    WorkflowConcurrency, WorkflowRef, WorkflowRun, WorkflowRunInfo, WorkflowRunJob,
};

use super::{
    ConcurrencyGroupRow, RunInfoRow, RunJobRow, RunRow, RunStore, UnitOfWork, distinct_groups,
    encode_rule, job_stamps, scope_binds,
};

/// SQLite-backed run store.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` (e.g. `sqlite:.data/cds.db`), creating the file if
    /// needed, and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        migrations::run_sqlite(&pool).await?;
        debug!(url = %url, "SQLite run store ready");

        Ok(Self { pool })
    }

    /// Open the database file at `path`, creating parent directories.
    pub async fn from_path(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::Database(sqlx::Error::Io(e)))?;
        }

        Self::connect(&format!("sqlite:{}", path.to_string_lossy()), max_connections).await
    }

    /// A private in-memory database. Used by tests and single-process setups.
    ///
    /// The pool keeps a single connection for its whole lifetime: closing it
    /// would drop the database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteUnitOfWork { tx }))
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

/// One SQLite transaction.
pub struct SqliteUnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    async fn insert_run(&mut self, run: &WorkflowRun) -> Result<()> {
        let (concurrency, concurrency_name, concurrency_scope) =
            encode_rule(run.concurrency.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO v2_workflow_run (
                id, project_key, vcs_server, repository, workflow_name, run_number,
                run_attempt, status, started, last_modified, username, workflow_data,
                concurrency, concurrency_name, concurrency_scope, git_ref
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.project_key)
        .bind(&run.vcs_server)
        .bind(&run.repository)
        .bind(&run.workflow_name)
        .bind(run.run_number)
        .bind(run.run_attempt)
        .bind(run.status.as_str())
        .bind(run.started)
        .bind(run.last_modified)
        .bind(&run.username)
        .bind(serde_json::to_string(&run.workflow_data)?)
        .bind(concurrency)
        .bind(concurrency_name)
        .bind(concurrency_scope)
        .bind(&run.git_ref)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn get_run(&mut self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT seq, id, project_key, vcs_server, repository, workflow_name, run_number,
                   run_attempt, status, started, last_modified, username, workflow_data,
                   concurrency, git_ref
            FROM v2_workflow_run
            WHERE id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(WorkflowRun::try_from).transpose()
    }

    async fn update_run_status(
        &mut self,
        run_id: &str,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE v2_workflow_run
            SET status = ?, last_modified = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(at)
        .bind(run_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    async fn set_run_concurrency(
        &mut self,
        run_id: &str,
        rule: Option<&WorkflowConcurrency>,
    ) -> Result<()> {
        let (concurrency, concurrency_name, concurrency_scope) = encode_rule(rule)?;

        let result = sqlx::query(
            r#"
            UPDATE v2_workflow_run
            SET concurrency = ?, concurrency_name = ?, concurrency_scope = ?
            WHERE id = ?
            "#,
        )
        .bind(concurrency)
        .bind(concurrency_name)
        .bind(concurrency_scope)
        .bind(run_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    async fn insert_run_job(&mut self, job: &WorkflowRunJob) -> Result<()> {
        let (concurrency, concurrency_name, concurrency_scope) =
            encode_rule(job.concurrency.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO v2_workflow_run_job (
                id, workflow_run_id, job_id, project_key, vcs_server, repository,
                workflow_name, run_number, run_attempt, status, queued, started, ended,
                initiator, job, concurrency, concurrency_name, concurrency_scope
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.workflow_run_id)
        .bind(&job.job_id)
        .bind(&job.project_key)
        .bind(&job.vcs_server)
        .bind(&job.repository)
        .bind(&job.workflow_name)
        .bind(job.run_number)
        .bind(job.run_attempt)
        .bind(job.status.as_str())
        .bind(job.queued)
        .bind(job.started)
        .bind(job.ended)
        .bind(&job.initiator)
        .bind(serde_json::to_string(&job.job)?)
        .bind(concurrency)
        .bind(concurrency_name)
        .bind(concurrency_scope)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn get_run_job(&mut self, job_id: &str) -> Result<Option<WorkflowRunJob>> {
        let row = sqlx::query_as::<_, RunJobRow>(
            r#"
            SELECT seq, id, workflow_run_id, job_id, project_key, vcs_server, repository,
                   workflow_name, run_number, run_attempt, status, queued, started, ended,
                   initiator, job, concurrency
            FROM v2_workflow_run_job
            WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(WorkflowRunJob::try_from).transpose()
    }

    async fn list_run_jobs(&mut self, run_id: &str) -> Result<Vec<WorkflowRunJob>> {
        let rows = sqlx::query_as::<_, RunJobRow>(
            r#"
            SELECT seq, id, workflow_run_id, job_id, project_key, vcs_server, repository,
                   workflow_name, run_number, run_attempt, status, queued, started, ended,
                   initiator, job, concurrency
            FROM v2_workflow_run_job
            WHERE workflow_run_id = ?
            ORDER BY seq
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(WorkflowRunJob::try_from).collect()
    }

    async fn update_run_job_status(
        &mut self,
        job_id: &str,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let (started, ended) = job_stamps(status, at);

        let result = sqlx::query(
            r#"
            UPDATE v2_workflow_run_job
            SET status = ?, started = COALESCE(started, ?), ended = COALESCE(ended, ?)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(started)
        .bind(ended)
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RunJobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn set_run_job_concurrency(
        &mut self,
        job_id: &str,
        rule: Option<&WorkflowConcurrency>,
    ) -> Result<()> {
        let (concurrency, concurrency_name, concurrency_scope) = encode_rule(rule)?;

        let result = sqlx::query(
            r#"
            UPDATE v2_workflow_run_job
            SET concurrency = ?, concurrency_name = ?, concurrency_scope = ?
            WHERE id = ?
            "#,
        )
        .bind(concurrency)
        .bind(concurrency_name)
        .bind(concurrency_scope)
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RunJobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn insert_run_info(&mut self, info: &WorkflowRunInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO v2_workflow_run_info (workflow_run_id, issued_at, level, message)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&info.workflow_run_id)
        .bind(info.issued_at)
        .bind(info.level.as_str())
        .bind(&info.message)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn list_run_infos(&mut self, run_id: &str) -> Result<Vec<WorkflowRunInfo>> {
        let rows = sqlx::query_as::<_, RunInfoRow>(
            r#"
            SELECT id, workflow_run_id, issued_at, level, message
            FROM v2_workflow_run_info
            WHERE workflow_run_id = ?
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(WorkflowRunInfo::try_from).collect()
    }

    async fn upsert_project_concurrency(
        &mut self,
        project_key: &str,
        rule: &WorkflowConcurrency,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_concurrency (project_key, name, definition)
            VALUES (?, ?, ?)
            ON CONFLICT (project_key, name) DO UPDATE SET definition = excluded.definition
            "#,
        )
        .bind(project_key)
        .bind(&rule.name)
        .bind(serde_json::to_string(rule)?)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn load_project_concurrencies(
        &mut self,
        project_key: &str,
    ) -> Result<Vec<WorkflowConcurrency>> {
        let definitions: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT definition
            FROM project_concurrency
            WHERE project_key = ?
            ORDER BY name
            "#,
        )
        .bind(project_key)
        .fetch_all(&mut *self.tx)
        .await?;

        definitions
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .collect()
    }

    async fn lock_concurrency_group(&mut self, _key: &ConcurrencyScopeKey) -> Result<()> {
        // The write lock taken by BEGIN IMMEDIATE already covers every group.
        Ok(())
    }

    async fn load_concurrency_objects(
        &mut self,
        key: &ConcurrencyScopeKey,
    ) -> Result<Vec<ConcurrencyObject>> {
        let (is_project, vcs_server, repository, workflow_name) = scope_binds(key);
        let scope = key.scope().as_str();

        let runs = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT seq, id, project_key, vcs_server, repository, workflow_name, run_number,
                   run_attempt, status, started, last_modified, username, workflow_data,
                   concurrency, git_ref
            FROM v2_workflow_run
            WHERE project_key = ? AND concurrency_name = ? AND concurrency_scope = ?
              AND (? OR (vcs_server = ? AND repository = ? AND workflow_name = ?))
              AND status IN ('Building', 'Blocked')
            ORDER BY seq
            "#,
        )
        .bind(&key.project_key)
        .bind(&key.rule_name)
        .bind(scope)
        .bind(is_project)
        .bind(vcs_server)
        .bind(repository)
        .bind(workflow_name)
        .fetch_all(&mut *self.tx)
        .await?;

        let jobs = sqlx::query_as::<_, RunJobRow>(
            r#"
            SELECT seq, id, workflow_run_id, job_id, project_key, vcs_server, repository,
                   workflow_name, run_number, run_attempt, status, queued, started, ended,
                   initiator, job, concurrency
            FROM v2_workflow_run_job
            WHERE project_key = ? AND concurrency_name = ? AND concurrency_scope = ?
              AND (? OR (vcs_server = ? AND repository = ? AND workflow_name = ?))
              AND status IN ('Waiting', 'Scheduling', 'Building', 'Blocked')
            ORDER BY seq
            "#,
        )
        .bind(&key.project_key)
        .bind(&key.rule_name)
        .bind(scope)
        .bind(is_project)
        .bind(vcs_server)
        .bind(repository)
        .bind(workflow_name)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut objects = Vec::with_capacity(runs.len() + jobs.len());
        for row in runs {
            objects.push(ConcurrencyObject::Workflow(WorkflowRun::try_from(row)?));
        }
        for row in jobs {
            objects.push(ConcurrencyObject::Job(WorkflowRunJob::try_from(row)?));
        }
        Ok(objects)
    }

    async fn list_blocked_concurrency_groups(
        &mut self,
        after: Option<&ConcurrencyScopeKey>,
        limit: i64,
    ) -> Result<Vec<ConcurrencyScopeKey>> {
        let rows = sqlx::query_as::<_, ConcurrencyGroupRow>(
            r#"
            SELECT DISTINCT project_key, vcs_server, repository, workflow_name,
                   concurrency_name, concurrency_scope
            FROM v2_workflow_run
            WHERE status = 'Blocked'
              AND concurrency_name IS NOT NULL AND concurrency_scope IS NOT NULL
            UNION
            SELECT DISTINCT project_key, vcs_server, repository, workflow_name,
                   concurrency_name, concurrency_scope
            FROM v2_workflow_run_job
            WHERE status = 'Blocked'
              AND concurrency_name IS NOT NULL AND concurrency_scope IS NOT NULL
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        distinct_groups(rows, after, limit)
    }

    async fn upsert_project_run_retention(
        &mut self,
        retention: &ProjectRunRetention,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_run_retention (project_key, definition)
            VALUES (?, ?)
            ON CONFLICT (project_key) DO UPDATE SET definition = excluded.definition
            "#,
        )
        .bind(&retention.project_key)
        .bind(serde_json::to_string(retention)?)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn load_project_run_retention(
        &mut self,
        project_key: &str,
    ) -> Result<Option<ProjectRunRetention>> {
        let definition: Option<String> = sqlx::query_scalar(
            "SELECT definition FROM project_run_retention WHERE project_key = ?",
        )
        .bind(project_key)
        .fetch_optional(&mut *self.tx)
        .await?;

        definition
            .map(|raw| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }

    async fn list_run_project_keys(&mut self) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar(
            "SELECT DISTINCT project_key FROM v2_workflow_run ORDER BY project_key",
        )
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(keys)
    }

    async fn list_run_workflow_refs(
        &mut self,
        project_key: &str,
    ) -> Result<Vec<(WorkflowRef, String)>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT vcs_server, repository, workflow_name, git_ref
            FROM v2_workflow_run
            WHERE project_key = ?
            ORDER BY vcs_server, repository, workflow_name, git_ref
            "#,
        )
        .bind(project_key)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(vcs, repo, name, git_ref)| (WorkflowRef::new(vcs, repo, name), git_ref))
            .collect())
    }

    async fn list_terminated_runs_older_than(
        &mut self,
        project_key: &str,
        workflow: &WorkflowRef,
        git_ref: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id
            FROM v2_workflow_run
            WHERE project_key = ? AND vcs_server = ? AND repository = ?
              AND workflow_name = ? AND git_ref = ?
              AND status IN ('Stopped', 'Success', 'Fail', 'Skipped')
              AND julianday(last_modified) < julianday(?)
            ORDER BY last_modified, seq
            LIMIT ?
            "#,
        )
        .bind(project_key)
        .bind(&workflow.vcs_server)
        .bind(&workflow.repository)
        .bind(&workflow.workflow_name)
        .bind(git_ref)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(ids)
    }

    async fn list_terminated_runs_beyond(
        &mut self,
        project_key: &str,
        workflow: &WorkflowRef,
        git_ref: &str,
        keep: i64,
        limit: i64,
    ) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id
            FROM (
                SELECT id, status, run_number, seq
                FROM v2_workflow_run
                WHERE project_key = ? AND vcs_server = ? AND repository = ?
                  AND workflow_name = ? AND git_ref = ?
                ORDER BY run_number DESC, seq DESC
                LIMIT -1 OFFSET ?
            )
            WHERE status IN ('Stopped', 'Success', 'Fail', 'Skipped')
            ORDER BY run_number, seq
            LIMIT ?
            "#,
        )
        .bind(project_key)
        .bind(&workflow.vcs_server)
        .bind(&workflow.repository)
        .bind(&workflow.workflow_name)
        .bind(git_ref)
        .bind(keep.max(0))
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(ids)
    }

    async fn delete_runs(&mut self, run_ids: &[String]) -> Result<u64> {
        if run_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; run_ids.len()].join(", ");

        for table in ["v2_workflow_run_info", "v2_workflow_run_job"] {
            let sql = format!("DELETE FROM {table} WHERE workflow_run_id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in run_ids {
                query = query.bind(id);
            }
            query.execute(&mut *self.tx).await?;
        }

        let sql = format!("DELETE FROM v2_workflow_run WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in run_ids {
            query = query.bind(id);
        }
        let result = query.execute(&mut *self.tx).await?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::with_transaction;
    use crate::types::{ConcurrencyScope, JobDefinition, RetentionRule, RunInfoLevel};
    use chrono::Duration;

    fn workflow() -> WorkflowRef {
        WorkflowRef::new("github", "ovh/cds", "build")
    }

    fn rule(name: &str, scope: ConcurrencyScope) -> WorkflowConcurrency {
        let mut rule = WorkflowConcurrency::new(name);
        rule.scope = scope;
        rule
    }

    fn run_with(status: RunStatus, rule: Option<WorkflowConcurrency>) -> WorkflowRun {
        let mut run = WorkflowRun::new("PROJ", &workflow(), 1, "admin");
        run.status = status;
        run.concurrency = rule;
        run
    }

    #[tokio::test]
    async fn test_insert_and_get_run() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let mut run = run_with(RunStatus::Blocked, Some(rule("deploy", ConcurrencyScope::Workflow)));
        run.workflow_data.concurrency = Some("deploy".to_string());

        let mut uow = store.begin().await.unwrap();
        uow.insert_run(&run).await.unwrap();
        let loaded = uow.get_run(&run.id).await.unwrap().expect("run should exist");
        uow.commit().await.unwrap();

        assert!(loaded.seq > 0);
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.status, RunStatus::Blocked);
        assert_eq!(loaded.concurrency, run.concurrency);
        assert_eq!(loaded.workflow_data, run.workflow_data);
        assert_eq!(loaded.last_modified, run.last_modified);
    }

    #[tokio::test]
    async fn test_get_run_not_found() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let mut uow = store.begin().await.unwrap();
        assert!(uow.get_run("missing").await.unwrap().is_none());

        let err = uow
            .update_run_status("missing", RunStatus::Building, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_dropped_unit_of_work_rolls_back() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let run = run_with(RunStatus::Building, None);

        {
            let mut uow = store.begin().await.unwrap();
            uow.insert_run(&run).await.unwrap();
        }

        let mut uow = store.begin().await.unwrap();
        assert!(uow.get_run(&run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_transaction_commits_and_rolls_back() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let kept = run_with(RunStatus::Building, None);
        let discarded = run_with(RunStatus::Building, None);

        let to_insert = kept.clone();
        with_transaction::<_, Error, _>(&store, move |uow| {
            Box::pin(async move { uow.insert_run(&to_insert).await })
        })
        .await
        .unwrap();

        let to_insert = discarded.clone();
        let result = with_transaction::<(), Error, _>(&store, move |uow| {
            Box::pin(async move {
                uow.insert_run(&to_insert).await?;
                Err(Error::RunNotFound("boom".to_string()))
            })
        })
        .await;
        assert!(result.is_err());

        let mut uow = store.begin().await.unwrap();
        assert!(uow.get_run(&kept.id).await.unwrap().is_some());
        assert!(uow.get_run(&discarded.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_status_stamps() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let run = run_with(RunStatus::Building, None);
        let job = WorkflowRunJob::for_run(&run, "compile", JobDefinition::default());

        let mut uow = store.begin().await.unwrap();
        uow.insert_run(&run).await.unwrap();
        uow.insert_run_job(&job).await.unwrap();

        let started_at = Utc::now();
        uow.update_run_job_status(&job.id, JobStatus::Building, started_at)
            .await
            .unwrap();
        let ended_at = started_at + Duration::seconds(30);
        uow.update_run_job_status(&job.id, JobStatus::Success, ended_at)
            .await
            .unwrap();

        let loaded = uow.get_run_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Success);
        assert_eq!(loaded.started, Some(started_at));
        assert_eq!(loaded.ended, Some(ended_at));

        let jobs = uow.list_run_jobs(&run.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_run_infos_in_issue_order() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let run = run_with(RunStatus::Blocked, None);

        let mut uow = store.begin().await.unwrap();
        uow.insert_run(&run).await.unwrap();
        uow.insert_run_info(&WorkflowRunInfo::new(&run.id, RunInfoLevel::Info, "first"))
            .await
            .unwrap();
        uow.insert_run_info(&WorkflowRunInfo::new(&run.id, RunInfoLevel::Warning, "second"))
            .await
            .unwrap();

        let infos = uow.list_run_infos(&run.id).await.unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].message, "first");
        assert_eq!(infos[1].level, RunInfoLevel::Warning);
        assert!(infos[0].id < infos[1].id);
    }

    #[tokio::test]
    async fn test_project_concurrency_upsert() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let mut uow = store.begin().await.unwrap();

        let mut deploy = WorkflowConcurrency::new("deploy");
        uow.upsert_project_concurrency("PROJ", &deploy).await.unwrap();
        deploy.pool = 4;
        uow.upsert_project_concurrency("PROJ", &deploy).await.unwrap();
        uow.upsert_project_concurrency("OTHER", &WorkflowConcurrency::new("lint"))
            .await
            .unwrap();

        let rules = uow.load_project_concurrencies("PROJ").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pool, 4);
    }

    #[tokio::test]
    async fn test_load_concurrency_objects_filters_scope_and_status() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let deploy = rule("deploy", ConcurrencyScope::Workflow);

        let blocked = run_with(RunStatus::Blocked, Some(deploy.clone()));
        let building = run_with(RunStatus::Building, Some(deploy.clone()));
        let finished = run_with(RunStatus::Success, Some(deploy.clone()));
        let other_rule = run_with(RunStatus::Blocked, Some(rule("lint", ConcurrencyScope::Workflow)));
        let mut other_workflow = run_with(RunStatus::Blocked, Some(deploy.clone()));
        other_workflow.workflow_name = "release".to_string();

        let mut job = WorkflowRunJob::for_run(&building, "migrate", JobDefinition::default());
        job.status = JobStatus::Scheduling;
        job.concurrency = Some(deploy.clone());

        let mut uow = store.begin().await.unwrap();
        for run in [&blocked, &building, &finished, &other_rule, &other_workflow] {
            uow.insert_run(run).await.unwrap();
        }
        uow.insert_run_job(&job).await.unwrap();

        let key = ConcurrencyScopeKey::workflow("PROJ", workflow(), "deploy");
        let objects = uow.load_concurrency_objects(&key).await.unwrap();
        let ids: Vec<&str> = objects.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![blocked.id.as_str(), building.id.as_str(), job.id.as_str()]);
    }

    #[tokio::test]
    async fn test_project_scope_spans_workflows() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let shared = rule("shared", ConcurrencyScope::Project);

        let first = run_with(RunStatus::Building, Some(shared.clone()));
        let mut second = run_with(RunStatus::Blocked, Some(shared.clone()));
        second.workflow_name = "release".to_string();
        let mut foreign = run_with(RunStatus::Blocked, Some(shared.clone()));
        foreign.project_key = "OTHER".to_string();

        let mut uow = store.begin().await.unwrap();
        for run in [&first, &second, &foreign] {
            uow.insert_run(run).await.unwrap();
        }

        let objects = uow
            .load_concurrency_objects(&ConcurrencyScopeKey::project("PROJ", "shared"))
            .await
            .unwrap();
        assert_eq!(objects.len(), 2);

        let groups = uow.list_blocked_concurrency_groups(None, 10).await.unwrap();
        assert_eq!(
            groups,
            vec![
                ConcurrencyScopeKey::project("OTHER", "shared"),
                ConcurrencyScopeKey::project("PROJ", "shared"),
            ]
        );
    }

    #[tokio::test]
    async fn test_blocked_groups_page_after_cursor() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let mut uow = store.begin().await.unwrap();
        for name in ["a", "b", "c"] {
            uow.insert_run(&run_with(
                RunStatus::Blocked,
                Some(rule(name, ConcurrencyScope::Project)),
            ))
            .await
            .unwrap();
        }

        let first = uow.list_blocked_concurrency_groups(None, 2).await.unwrap();
        assert_eq!(
            first,
            vec![
                ConcurrencyScopeKey::project("PROJ", "a"),
                ConcurrencyScopeKey::project("PROJ", "b"),
            ]
        );

        let next = uow
            .list_blocked_concurrency_groups(first.last(), 2)
            .await
            .unwrap();
        assert_eq!(next, vec![ConcurrencyScopeKey::project("PROJ", "c")]);

        let past_end = uow
            .list_blocked_concurrency_groups(next.last(), 2)
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_retention_lists_and_deletes_old_terminated_runs() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let now = Utc::now();

        let mut old_done = run_with(RunStatus::Success, None);
        old_done.last_modified = now - Duration::days(100);
        let mut old_active = run_with(RunStatus::Building, None);
        old_active.last_modified = now - Duration::days(100);
        let recent_done = run_with(RunStatus::Fail, None);
        let mut other_ref = run_with(RunStatus::Success, None);
        other_ref.git_ref = "refs/heads/feature".to_string();
        other_ref.last_modified = now - Duration::days(100);
        let job = WorkflowRunJob::for_run(&old_done, "compile", JobDefinition::default());

        let mut uow = store.begin().await.unwrap();
        for run in [&old_done, &old_active, &recent_done, &other_ref] {
            uow.insert_run(run).await.unwrap();
        }
        uow.insert_run_job(&job).await.unwrap();
        uow.insert_run_info(&WorkflowRunInfo::new(&old_done.id, RunInfoLevel::Info, "done"))
            .await
            .unwrap();

        let cutoff = now - Duration::days(90);
        let ids = uow
            .list_terminated_runs_older_than("PROJ", &workflow(), "", cutoff, 10)
            .await
            .unwrap();
        assert_eq!(ids, vec![old_done.id.clone()]);

        assert_eq!(uow.delete_runs(&ids).await.unwrap(), 1);
        assert_eq!(uow.delete_runs(&[]).await.unwrap(), 0);
        assert!(uow.get_run(&old_done.id).await.unwrap().is_none());
        assert!(uow.get_run_job(&job.id).await.unwrap().is_none());
        assert!(uow.list_run_infos(&old_done.id).await.unwrap().is_empty());
        assert!(uow.get_run(&old_active.id).await.unwrap().is_some());
        assert!(uow.get_run(&other_ref.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retention_lists_terminated_runs_beyond_count() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let mut uow = store.begin().await.unwrap();

        let mut runs = Vec::new();
        for (number, status) in [
            (1, RunStatus::Success),
            (2, RunStatus::Building),
            (3, RunStatus::Fail),
            (4, RunStatus::Success),
            (5, RunStatus::Success),
        ] {
            let mut run = run_with(status, None);
            run.run_number = number;
            uow.insert_run(&run).await.unwrap();
            runs.push(run);
        }

        let ids = uow
            .list_terminated_runs_beyond("PROJ", &workflow(), "", 2, 10)
            .await
            .unwrap();
        assert_eq!(ids, vec![runs[0].id.clone(), runs[2].id.clone()]);

        let ids = uow
            .list_terminated_runs_beyond("PROJ", &workflow(), "", 2, 1)
            .await
            .unwrap();
        assert_eq!(ids, vec![runs[0].id.clone()]);

        assert!(uow
            .list_terminated_runs_beyond("PROJ", &workflow(), "", 5, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_run_retention_policy_and_workflow_refs() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        let mut uow = store.begin().await.unwrap();

        assert!(uow.load_project_run_retention("PROJ").await.unwrap().is_none());

        let mut policy = ProjectRunRetention::with_default("PROJ", RetentionRule::default());
        uow.upsert_project_run_retention(&policy).await.unwrap();
        policy.default_rule.count = 5;
        uow.upsert_project_run_retention(&policy).await.unwrap();
        assert_eq!(
            uow.load_project_run_retention("PROJ").await.unwrap(),
            Some(policy)
        );

        let main = run_with(RunStatus::Success, None);
        let mut feature = run_with(RunStatus::Success, None);
        feature.git_ref = "refs/heads/feature".to_string();
        let mut foreign = run_with(RunStatus::Success, None);
        foreign.project_key = "OTHER".to_string();
        for run in [&main, &feature, &foreign] {
            uow.insert_run(run).await.unwrap();
        }

        assert_eq!(
            uow.list_run_project_keys().await.unwrap(),
            vec!["OTHER".to_string(), "PROJ".to_string()]
        );
        assert_eq!(
            uow.list_run_workflow_refs("PROJ").await.unwrap(),
            vec![
                (workflow(), String::new()),
                (workflow(), "refs/heads/feature".to_string()),
            ]
        );
        let loaded = uow.get_run(&feature.id).await.unwrap().unwrap();
        assert_eq!(loaded.git_ref, "refs/heads/feature");
    }

    #[tokio::test]
    async fn test_immediate_transactions_serialize_file_writers() {
        let path = std::env::temp_dir().join(format!("cds-core-{}.db", uuid::Uuid::new_v4()));
        let store = SqliteRunStore::from_path(&path, 2).await.unwrap();

        let first = store.begin().await.unwrap();
        let waiting = {
            let store = store.clone();
            tokio::spawn(async move {
                let uow = store.begin().await.unwrap();
                uow.rollback().await.unwrap();
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!waiting.is_finished(), "second writer must wait for the first");

        first.commit().await.unwrap();
        waiting.await.unwrap();

        store.pool().close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = SqliteRunStore::in_memory().await.unwrap();
        assert!(store.health_check().await.unwrap());
    }
}
