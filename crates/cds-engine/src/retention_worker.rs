// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker applying project run retention policies.
//!
//! Each pass walks every project that owns runs. The project policy (or the
//! configured default rule when the project has none) selects a
//! [`RetentionRule`] for every workflow and git ref the project has runs
//! for:
//!
//! ```text
//!   workflow "vcs/repo/name" ──► first matching workflow pattern
//!                                   │ none: project default
//!                                   ▼
//!   git ref ─────────────────► first matching ref pattern
//!                                   │ none: workflow default, then project default
//!                                   ▼
//!                              RetentionRule { count, duration_in_days }
//! ```
//!
//! Terminated runs (stopped, success, fail, skipped) older than
//! `duration_in_days` are deleted, then terminated runs past the `count`
//! most recent ones. Runs are deleted with their job runs and run infos, in
//! batches, one transaction per batch.

use std::sync::Arc;
use std::time::Duration;

use cds_core::persistence::RunStore;
use cds_core::types::{ProjectRunRetention, RetentionRule, WorkflowRef};
use chrono::{DateTime, Utc};
use glob::Pattern;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Configuration for the retention worker.
#[derive(Debug, Clone)]
pub struct RetentionWorkerConfig {
    /// Whether retention is enabled.
    pub enabled: bool,
    /// How often to run retention.
    pub poll_interval: Duration,
    /// Rule for projects without a stored retention policy.
    pub default_rule: RetentionRule,
    /// Maximum runs to delete per batch.
    pub batch_size: i64,
}

impl Default for RetentionWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            default_rule: RetentionRule::default(),
            batch_size: 100,
        }
    }
}

impl RetentionWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CDS_RETENTION_ENABLED`: "true" or "1" to enable (default: false)
    /// - `CDS_RETENTION_POLL_INTERVAL_SECS`: seconds between passes (default: 3600)
    /// - `CDS_RETENTION_DEFAULT_COUNT`: runs kept per workflow and ref (default: 50)
    /// - `CDS_RETENTION_DEFAULT_DURATION_DAYS`: days before terminated runs are deleted (default: 90)
    /// - `CDS_RETENTION_BATCH_SIZE`: max runs per batch (default: 100)
    pub fn from_env() -> Self {
        let defaults = RetentionRule::default();

        let enabled = std::env::var("CDS_RETENTION_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval_secs = std::env::var("CDS_RETENTION_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let count = std::env::var("CDS_RETENTION_DEFAULT_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.count);

        let duration_in_days = std::env::var("CDS_RETENTION_DEFAULT_DURATION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.duration_in_days);

        let batch_size = std::env::var("CDS_RETENTION_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            default_rule: RetentionRule {
                count,
                duration_in_days,
            },
            batch_size,
        }
    }
}

/// A project retention policy with its glob patterns compiled.
#[derive(Debug, Clone)]
pub struct RetentionMatcher {
    default_rule: RetentionRule,
    workflows: Vec<WorkflowMatcher>,
}

#[derive(Debug, Clone)]
struct WorkflowMatcher {
    pattern: Pattern,
    default_rule: Option<RetentionRule>,
    git_refs: Vec<(Pattern, RetentionRule)>,
}

impl RetentionMatcher {
    /// Compile the patterns of `policy`.
    pub fn new(policy: &ProjectRunRetention) -> Result<Self> {
        let mut workflows = Vec::with_capacity(policy.workflows.len());
        for workflow in &policy.workflows {
            let mut git_refs = Vec::with_capacity(workflow.rules.len());
            for rule in &workflow.rules {
                git_refs.push((compile(&rule.git_ref)?, rule.rule));
            }
            workflows.push(WorkflowMatcher {
                pattern: compile(&workflow.workflow)?,
                default_rule: workflow.default_rule,
                git_refs,
            });
        }

        Ok(Self {
            default_rule: policy.default_rule,
            workflows,
        })
    }

    /// Rule for the runs of `workflow_full_name` on `git_ref`.
    pub fn rule_for(&self, workflow_full_name: &str, git_ref: &str) -> RetentionRule {
        let Some(workflow) = self
            .workflows
            .iter()
            .find(|w| w.pattern.matches(workflow_full_name))
        else {
            return self.default_rule;
        };

        workflow
            .git_refs
            .iter()
            .find(|(pattern, _)| pattern.matches(git_ref))
            .map(|(_, rule)| *rule)
            .or(workflow.default_rule)
            .unwrap_or(self.default_rule)
    }
}

fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|source| Error::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Which terminated runs of a workflow ref a batch selects.
#[derive(Debug, Clone, Copy)]
enum Selection {
    OlderThan(DateTime<Utc>),
    BeyondCount(i64),
}

/// Background worker that applies run retention policies.
pub struct RetentionWorker {
    store: Arc<dyn RunStore>,
    config: RetentionWorkerConfig,
    shutdown: Arc<Notify>,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(store: Arc<dyn RunStore>, config: RetentionWorkerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Retention worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            default_count = self.config.default_rule.count,
            default_duration_days = self.config.default_rule.duration_in_days,
            batch_size = self.config.batch_size,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.purge_old_runs().await {
                        error!(error = %e, "Failed to purge old workflow runs");
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }

    /// Apply the retention policy of every project. Returns the number of
    /// runs deleted.
    ///
    /// A project whose policy fails to apply is logged and skipped.
    pub async fn purge_old_runs(&self) -> Result<u64> {
        let projects = {
            let mut uow = self.store.begin().await?;
            let projects = uow.list_run_project_keys().await?;
            uow.commit().await?;
            projects
        };

        let mut total_deleted = 0u64;
        for project_key in &projects {
            match self.purge_project(project_key).await {
                Ok(deleted) => total_deleted += deleted,
                Err(e) => {
                    error!(project_key = %project_key, error = %e, "Failed to apply run retention");
                }
            }
        }

        if total_deleted > 0 {
            info!(
                projects = projects.len(),
                total_deleted = total_deleted,
                "Retention pass completed"
            );
        }

        Ok(total_deleted)
    }

    /// Apply the retention policy of one project. Returns the number of runs
    /// deleted.
    pub async fn purge_project(&self, project_key: &str) -> Result<u64> {
        let (policy, workflow_refs) = {
            let mut uow = self.store.begin().await?;
            let policy = uow
                .load_project_run_retention(project_key)
                .await?
                .unwrap_or_else(|| {
                    ProjectRunRetention::with_default(project_key, self.config.default_rule)
                });
            let workflow_refs = uow.list_run_workflow_refs(project_key).await?;
            uow.commit().await?;
            (policy, workflow_refs)
        };

        let matcher = RetentionMatcher::new(&policy)?;

        let mut deleted = 0u64;
        for (workflow, git_ref) in &workflow_refs {
            let rule = matcher.rule_for(&workflow.full_name(), git_ref);
            deleted += self
                .purge_workflow_ref(project_key, workflow, git_ref, rule)
                .await?;
        }

        debug!(project_key = %project_key, deleted = deleted, "Applied run retention");

        Ok(deleted)
    }

    async fn purge_workflow_ref(
        &self,
        project_key: &str,
        workflow: &WorkflowRef,
        git_ref: &str,
        rule: RetentionRule,
    ) -> Result<u64> {
        let mut deleted = 0;

        if rule.duration_in_days > 0 {
            let cutoff = chrono::Duration::try_days(rule.duration_in_days)
                .and_then(|age| Utc::now().checked_sub_signed(age))
                .ok_or_else(|| {
                    Error::Other(format!(
                        "Retention duration out of range: {} days",
                        rule.duration_in_days
                    ))
                })?;
            deleted += self
                .delete_in_batches(project_key, workflow, git_ref, Selection::OlderThan(cutoff))
                .await?;
        }

        if rule.count > 0 {
            deleted += self
                .delete_in_batches(
                    project_key,
                    workflow,
                    git_ref,
                    Selection::BeyondCount(rule.count),
                )
                .await?;
        }

        Ok(deleted)
    }

    async fn delete_in_batches(
        &self,
        project_key: &str,
        workflow: &WorkflowRef,
        git_ref: &str,
        selection: Selection,
    ) -> Result<u64> {
        let mut total_deleted = 0u64;

        loop {
            let mut uow = self.store.begin().await?;
            let run_ids = match selection {
                Selection::OlderThan(cutoff) => {
                    uow.list_terminated_runs_older_than(
                        project_key,
                        workflow,
                        git_ref,
                        cutoff,
                        self.config.batch_size,
                    )
                    .await?
                }
                Selection::BeyondCount(keep) => {
                    uow.list_terminated_runs_beyond(
                        project_key,
                        workflow,
                        git_ref,
                        keep,
                        self.config.batch_size,
                    )
                    .await?
                }
            };

            if run_ids.is_empty() {
                break;
            }

            let batch_size = run_ids.len();
            let deleted = uow.delete_runs(&run_ids).await?;
            uow.commit().await?;

            total_deleted += deleted;

            debug!(
                project_key = %project_key,
                workflow = %workflow.full_name(),
                git_ref = %git_ref,
                selection = ?selection,
                batch_size = batch_size,
                deleted = deleted,
                "Deleted batch of workflow runs"
            );

            if (batch_size as i64) < self.config.batch_size {
                break;
            }
        }

        Ok(total_deleted)
    }
}
