//! PostgreSQL-backed persistence implementation.
//!
//! Admission decisions for one rule group are serialized with a
//! transaction-scoped advisory lock keyed on the group's unique key. Row
//! locks are not enough: a run entering a group has no row in the group
//! yet for a concurrent decision to lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
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

/// PostgreSQL-backed run store.
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        migrations::run_postgres(&pool).await?;
        debug!(max_connections = max_connections, "PostgreSQL run store ready");

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresUnitOfWork { tx }))
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

/// One PostgreSQL transaction.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
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
            WHERE id = $1
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
            SET status = $1, last_modified = $2
            WHERE id = $3
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
            SET concurrency = $1, concurrency_name = $2, concurrency_scope = $3
            WHERE id = $4
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
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
            WHERE id = $1
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
            WHERE workflow_run_id = $1
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
            SET status = $1, started = COALESCE(started, $2), ended = COALESCE(ended, $3)
            WHERE id = $4
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
            SET concurrency = $1, concurrency_name = $2, concurrency_scope = $3
            WHERE id = $4
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
            VALUES ($1, $2, $3, $4)
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
            WHERE workflow_run_id = $1
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
            VALUES ($1, $2, $3)
            ON CONFLICT (project_key, name) DO UPDATE SET definition = EXCLUDED.definition
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
            WHERE project_key = $1
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

    async fn lock_concurrency_group(&mut self, key: &ConcurrencyScopeKey) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key.unique_key())
            .execute(&mut *self.tx)
            .await?;
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
            WHERE project_key = $1 AND concurrency_name = $2 AND concurrency_scope = $3
              AND ($4 OR (vcs_server = $5 AND repository = $6 AND workflow_name = $7))
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
            WHERE project_key = $1 AND concurrency_name = $2 AND concurrency_scope = $3
              AND ($4 OR (vcs_server = $5 AND repository = $6 AND workflow_name = $7))
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
            VALUES ($1, $2)
            ON CONFLICT (project_key) DO UPDATE SET definition = EXCLUDED.definition
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
            "SELECT definition FROM project_run_retention WHERE project_key = $1",
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
            WHERE project_key = $1
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
            WHERE project_key = $1 AND vcs_server = $2 AND repository = $3
              AND workflow_name = $4 AND git_ref = $5
              AND status IN ('Stopped', 'Success', 'Fail', 'Skipped')
              AND last_modified < $6
            ORDER BY last_modified, seq
            LIMIT $7
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
                WHERE project_key = $1 AND vcs_server = $2 AND repository = $3
                  AND workflow_name = $4 AND git_ref = $5
                ORDER BY run_number DESC, seq DESC
                OFFSET $6
            ) older
            WHERE status IN ('Stopped', 'Success', 'Fail', 'Skipped')
            ORDER BY run_number, seq
            LIMIT $7
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

        sqlx::query("DELETE FROM v2_workflow_run_info WHERE workflow_run_id = ANY($1)")
            .bind(run_ids)
            .execute(&mut *self.tx)
            .await?;

        sqlx::query("DELETE FROM v2_workflow_run_job WHERE workflow_run_id = ANY($1)")
            .bind(run_ids)
            .execute(&mut *self.tx)
            .await?;

        let result = sqlx::query("DELETE FROM v2_workflow_run WHERE id = ANY($1)")
            .bind(run_ids)
            .execute(&mut *self.tx)
            .await?;

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
