// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run engine: gates crafted runs and queued jobs behind their concurrency
//! rules and applies admission decisions.
//!
//! Every operation locks the rule group, reads it and writes the resulting
//! status changes in a single unit of work:
//!
//! ```text
//!   enqueue_run / enqueue_job          release / unlock_group
//!            │                                 │
//!            ▼                                 ▼
//!   resolve rule, check `if`,
//!   lock group, mark Blocked ──► retrieve_run_objects_to_unlock
//!                                              │
//!                               ┌──────────────┴──────────────┐
//!                               ▼                             ▼
//!                  unlock: run → Building          cancel: → Stopped
//!                          job → Waiting           + run info (warning)
//! ```
//!
//! The engine can be driven directly or through a [`RunTrigger`] feeding
//! [`RunEngine::run`].

use std::sync::Arc;

use cds_core::persistence::{RunStore, UnitOfWork, with_transaction};
use cds_core::types::{
    ConcurrencyObject, ConcurrencyObjectRef, ConcurrencyObjectType, ConcurrencyScopeKey,
    JobStatus, RunInfoLevel, RunStatus, WorkflowConcurrency, WorkflowRunInfo,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::concurrency::{
    ConcurrencyDecision, concurrency_condition_applies, normalize_condition,
    resolve_concurrency_definition, retrieve_run_objects_to_unlock,
};
use crate::error::{Error, Result};

/// Work item consumed by [`RunEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEnqueue {
    /// A crafted run is ready to start.
    Run {
        /// Run id.
        run_id: String,
    },
    /// A job run was queued.
    Job {
        /// Job run id.
        job_id: String,
    },
    /// A run or job run reached a final state and frees its slot.
    Release {
        /// The finished object.
        object: ConcurrencyObjectRef,
    },
}

/// Status changes applied for one admission decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedDecision {
    /// Objects released, in release order.
    pub unlocked: Vec<ConcurrencyObjectRef>,
    /// Objects stopped, oldest first.
    pub cancelled: Vec<ConcurrencyObjectRef>,
}

impl AppliedDecision {
    fn still_blocked(&self, object: &ConcurrencyObjectRef) -> bool {
        !self.unlocked.contains(object) && !self.cancelled.contains(object)
    }
}

/// Result of enqueueing a run or job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No rule applies; the object starts right away.
    Admitted,
    /// The object went through admission control.
    Gated {
        /// Whether the object itself is still waiting for a slot.
        blocked: bool,
        /// Changes applied to the rule group.
        decision: AppliedDecision,
    },
    /// The referenced rule has no definition; the object was stopped.
    RuleNotFound(String),
    /// The `if` condition of the rule could not be evaluated; the object
    /// was stopped.
    InvalidCondition(String),
    /// The object was not in an enqueueable state.
    Skipped,
}

/// Sending half of the engine queue.
#[derive(Debug, Clone)]
pub struct RunTrigger {
    sender: mpsc::Sender<RunEnqueue>,
}

impl RunTrigger {
    /// Create a trigger and the receiver to hand to [`RunEngine::run`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RunEnqueue>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Queue a work item.
    pub async fn send(&self, item: RunEnqueue) -> Result<()> {
        self.sender
            .send(item)
            .await
            .map_err(|_| Error::EngineStopped)
    }

    /// Queue a crafted run.
    pub async fn enqueue_run(&self, run_id: impl Into<String>) -> Result<()> {
        self.send(RunEnqueue::Run {
            run_id: run_id.into(),
        })
        .await
    }

    /// Queue a job run.
    pub async fn enqueue_job(&self, job_id: impl Into<String>) -> Result<()> {
        self.send(RunEnqueue::Job {
            job_id: job_id.into(),
        })
        .await
    }

    /// Signal that an object finished.
    pub async fn release(&self, object: ConcurrencyObjectRef) -> Result<()> {
        self.send(RunEnqueue::Release { object }).await
    }
}

/// Applies concurrency rules to runs and job runs.
#[derive(Clone)]
pub struct RunEngine {
    store: Arc<dyn RunStore>,
    shutdown: Arc<Notify>,
}

impl RunEngine {
    /// Create an engine over `store`.
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// The store the engine reads and writes.
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Get a handle that can be used to signal shutdown of [`run`](Self::run).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Consume work items until shutdown or until every trigger is dropped.
    ///
    /// Failures are logged and do not stop the loop.
    pub async fn run(&self, mut receiver: mpsc::Receiver<RunEnqueue>) {
        info!("Run engine started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Run engine received shutdown signal");
                    break;
                }

                item = receiver.recv() => {
                    let Some(item) = item else {
                        info!("Run engine queue closed");
                        break;
                    };
                    if let Err(e) = self.handle(item.clone()).await {
                        error!(error = %e, item = ?item, "Failed to process run engine item");
                    }
                }
            }
        }

        info!("Run engine stopped");
    }

    /// Process one work item.
    pub async fn handle(&self, item: RunEnqueue) -> Result<()> {
        match item {
            RunEnqueue::Run { run_id } => {
                self.enqueue_run(&run_id).await?;
            }
            RunEnqueue::Job { job_id } => {
                self.enqueue_job(&job_id).await?;
            }
            RunEnqueue::Release { object } => {
                self.release(&object).await?;
            }
        }
        Ok(())
    }

    /// Gate a crafted run behind its concurrency rule.
    ///
    /// Runs without a rule go straight to `Building`. Runs referencing an
    /// unknown rule are stopped with an error info.
    pub async fn enqueue_run(&self, run_id: &str) -> Result<EnqueueOutcome> {
        let mut uow = self.store.begin().await?;

        let run = uow
            .get_run(run_id)
            .await?
            .ok_or_else(|| cds_core::Error::RunNotFound(run_id.to_string()))?;

        if run.status != RunStatus::Crafting {
            debug!(run_id = %run_id, status = %run.status, "Run is not crafting, skipping");
            return Ok(EnqueueOutcome::Skipped);
        }

        let now = Utc::now();

        let Some(name) = run.workflow_data.concurrency.clone() else {
            uow.update_run_status(run_id, RunStatus::Building, now)
                .await?;
            uow.commit().await?;
            info!(run_id = %run_id, "Workflow run admitted");
            return Ok(EnqueueOutcome::Admitted);
        };

        let project_rules = uow.load_project_concurrencies(&run.project_key).await?;
        let Some(rule) =
            resolve_concurrency_definition(&run.workflow_data.concurrencies, &project_rules, &name)
        else {
            uow.insert_run_info(&WorkflowRunInfo::new(
                run_id,
                RunInfoLevel::Error,
                rule_not_found_message(&name),
            ))
            .await?;
            uow.update_run_status(run_id, RunStatus::Stopped, now)
                .await?;
            uow.commit().await?;
            warn!(run_id = %run_id, rule = %name, "Concurrency rule not found, run stopped");
            return Ok(EnqueueOutcome::RuleNotFound(name));
        };

        match concurrency_condition_applies(&rule) {
            Ok(true) => {}
            Ok(false) => {
                uow.insert_run_info(&WorkflowRunInfo::new(
                    run_id,
                    RunInfoLevel::Info,
                    condition_skipped_message(&name),
                ))
                .await?;
                uow.update_run_status(run_id, RunStatus::Building, now)
                    .await?;
                uow.commit().await?;
                info!(run_id = %run_id, rule = %name, "Concurrency condition is false, run admitted");
                return Ok(EnqueueOutcome::Admitted);
            }
            Err(e) => {
                let message = invalid_condition_message(&rule, &e);
                uow.insert_run_info(&WorkflowRunInfo::new(
                    run_id,
                    RunInfoLevel::Error,
                    message.clone(),
                ))
                .await?;
                uow.update_run_status(run_id, RunStatus::Stopped, now)
                    .await?;
                uow.commit().await?;
                warn!(run_id = %run_id, rule = %name, error = %e, "Invalid concurrency condition, run stopped");
                return Ok(EnqueueOutcome::InvalidCondition(message));
            }
        }

        let key = ConcurrencyScopeKey::for_rule(&run.project_key, run.workflow_ref(), &rule);
        uow.lock_concurrency_group(&key).await?;

        uow.set_run_concurrency(run_id, Some(&rule)).await?;
        uow.update_run_status(run_id, RunStatus::Blocked, now)
            .await?;

        let decision = retrieve_run_objects_to_unlock(uow.as_mut(), &key).await?;
        let applied = apply_decision(uow.as_mut(), decision, now).await?;

        let this = ConcurrencyObjectRef {
            id: run_id.to_string(),
            object_type: ConcurrencyObjectType::Workflow,
        };
        let blocked = applied.still_blocked(&this);
        if blocked {
            uow.insert_run_info(&WorkflowRunInfo::new(
                run_id,
                RunInfoLevel::Info,
                format!("Workflow run is blocked by concurrency rule \"{}\"", rule.name),
            ))
            .await?;
        }

        uow.commit().await?;

        info!(
            run_id = %run_id,
            rule = %key,
            blocked = blocked,
            unlocked = applied.unlocked.len(),
            cancelled = applied.cancelled.len(),
            "Workflow run enqueued"
        );

        Ok(EnqueueOutcome::Gated {
            blocked,
            decision: applied,
        })
    }

    /// Gate a queued job run behind its concurrency rule.
    ///
    /// Jobs without a rule stay `Waiting`. Jobs that were already gated are
    /// skipped.
    pub async fn enqueue_job(&self, job_id: &str) -> Result<EnqueueOutcome> {
        let mut uow = self.store.begin().await?;

        let job = uow
            .get_run_job(job_id)
            .await?
            .ok_or_else(|| cds_core::Error::RunJobNotFound(job_id.to_string()))?;

        if job.status != JobStatus::Waiting || job.concurrency.is_some() {
            debug!(job_id = %job_id, status = %job.status, "Job is not waiting for admission, skipping");
            return Ok(EnqueueOutcome::Skipped);
        }

        let Some(name) = job.job.concurrency.clone() else {
            return Ok(EnqueueOutcome::Admitted);
        };

        let run = uow
            .get_run(&job.workflow_run_id)
            .await?
            .ok_or_else(|| cds_core::Error::RunNotFound(job.workflow_run_id.clone()))?;

        let now = Utc::now();

        let project_rules = uow.load_project_concurrencies(&job.project_key).await?;
        let Some(rule) =
            resolve_concurrency_definition(&run.workflow_data.concurrencies, &project_rules, &name)
        else {
            uow.insert_run_info(&WorkflowRunInfo::new(
                &run.id,
                RunInfoLevel::Error,
                rule_not_found_message(&name),
            ))
            .await?;
            uow.update_run_job_status(job_id, JobStatus::Stopped, now)
                .await?;
            uow.commit().await?;
            warn!(job_id = %job_id, rule = %name, "Concurrency rule not found, job stopped");
            return Ok(EnqueueOutcome::RuleNotFound(name));
        };

        match concurrency_condition_applies(&rule) {
            Ok(true) => {}
            Ok(false) => {
                uow.insert_run_info(&WorkflowRunInfo::new(
                    &run.id,
                    RunInfoLevel::Info,
                    condition_skipped_message(&name),
                ))
                .await?;
                uow.commit().await?;
                info!(job_id = %job_id, rule = %name, "Concurrency condition is false, job admitted");
                return Ok(EnqueueOutcome::Admitted);
            }
            Err(e) => {
                let message = invalid_condition_message(&rule, &e);
                uow.insert_run_info(&WorkflowRunInfo::new(
                    &run.id,
                    RunInfoLevel::Error,
                    message.clone(),
                ))
                .await?;
                uow.update_run_job_status(job_id, JobStatus::Stopped, now)
                    .await?;
                uow.commit().await?;
                warn!(job_id = %job_id, rule = %name, error = %e, "Invalid concurrency condition, job stopped");
                return Ok(EnqueueOutcome::InvalidCondition(message));
            }
        }

        let key = ConcurrencyScopeKey::for_rule(&job.project_key, job.workflow_ref(), &rule);
        uow.lock_concurrency_group(&key).await?;

        uow.set_run_job_concurrency(job_id, Some(&rule)).await?;
        uow.update_run_job_status(job_id, JobStatus::Blocked, now)
            .await?;

        let decision = retrieve_run_objects_to_unlock(uow.as_mut(), &key).await?;
        let applied = apply_decision(uow.as_mut(), decision, now).await?;

        let this = ConcurrencyObjectRef {
            id: job_id.to_string(),
            object_type: ConcurrencyObjectType::Job,
        };
        let blocked = applied.still_blocked(&this);
        if blocked {
            uow.insert_run_info(&WorkflowRunInfo::new(
                &run.id,
                RunInfoLevel::Info,
                format!(
                    "Job \"{}\" is blocked by concurrency rule \"{}\"",
                    job.job_id, rule.name
                ),
            ))
            .await?;
        }

        uow.commit().await?;

        info!(
            job_id = %job_id,
            rule = %key,
            blocked = blocked,
            unlocked = applied.unlocked.len(),
            cancelled = applied.cancelled.len(),
            "Job run enqueued"
        );

        Ok(EnqueueOutcome::Gated {
            blocked,
            decision: applied,
        })
    }

    /// Recompute the rule group of a finished object and release waiters.
    ///
    /// Objects without a rule have nothing to release.
    pub async fn release(&self, object: &ConcurrencyObjectRef) -> Result<AppliedDecision> {
        let mut uow = self.store.begin().await?;

        let key = match object.object_type {
            ConcurrencyObjectType::Workflow => {
                let run = uow
                    .get_run(&object.id)
                    .await?
                    .ok_or_else(|| cds_core::Error::RunNotFound(object.id.clone()))?;
                run.concurrency.as_ref().map(|rule| {
                    ConcurrencyScopeKey::for_rule(&run.project_key, run.workflow_ref(), rule)
                })
            }
            ConcurrencyObjectType::Job => {
                let job = uow
                    .get_run_job(&object.id)
                    .await?
                    .ok_or_else(|| cds_core::Error::RunJobNotFound(object.id.clone()))?;
                job.concurrency.as_ref().map(|rule| {
                    ConcurrencyScopeKey::for_rule(&job.project_key, job.workflow_ref(), rule)
                })
            }
        };

        let Some(key) = key else {
            debug!(id = %object.id, "Released object has no concurrency rule");
            return Ok(AppliedDecision::default());
        };

        let applied = unlock_in(uow.as_mut(), &key).await?;
        uow.commit().await?;

        debug!(
            id = %object.id,
            rule = %key,
            unlocked = applied.unlocked.len(),
            "Released concurrency slot"
        );

        Ok(applied)
    }

    /// Re-apply admission to one rule group.
    pub async fn unlock_group(&self, key: &ConcurrencyScopeKey) -> Result<AppliedDecision> {
        let key = key.clone();
        with_transaction(self.store.as_ref(), move |uow| {
            Box::pin(async move { unlock_in(uow, &key).await })
        })
        .await
    }
}

async fn unlock_in(uow: &mut dyn UnitOfWork, key: &ConcurrencyScopeKey) -> Result<AppliedDecision> {
    uow.lock_concurrency_group(key).await?;
    let decision = retrieve_run_objects_to_unlock(uow, key).await?;
    apply_decision(uow, decision, Utc::now()).await
}

/// Write the status changes of `decision`.
async fn apply_decision(
    uow: &mut dyn UnitOfWork,
    decision: ConcurrencyDecision,
    at: DateTime<Utc>,
) -> Result<AppliedDecision> {
    let rule_name = decision
        .rule
        .as_ref()
        .map(|r| r.name.clone())
        .unwrap_or_default();
    let mut applied = AppliedDecision::default();

    for object in &decision.to_unlock {
        match object {
            ConcurrencyObject::Workflow(run) => {
                uow.update_run_status(&run.id, RunStatus::Building, at)
                    .await?;
            }
            ConcurrencyObject::Job(job) => {
                uow.update_run_job_status(&job.id, JobStatus::Waiting, at)
                    .await?;
            }
        }
        applied.unlocked.push(object.to_ref());
    }

    for object in &decision.to_cancel {
        match object {
            ConcurrencyObject::Workflow(run) => {
                uow.update_run_status(&run.id, RunStatus::Stopped, at)
                    .await?;
                for job in uow.list_run_jobs(&run.id).await? {
                    if !job.status.is_terminated() {
                        uow.update_run_job_status(&job.id, JobStatus::Stopped, at)
                            .await?;
                    }
                }
                uow.insert_run_info(&WorkflowRunInfo::new(
                    &run.id,
                    RunInfoLevel::Warning,
                    format!("Workflow run has been cancelled by concurrency rule \"{rule_name}\""),
                ))
                .await?;
            }
            ConcurrencyObject::Job(job) => {
                uow.update_run_job_status(&job.id, JobStatus::Stopped, at)
                    .await?;
                uow.insert_run_info(&WorkflowRunInfo::new(
                    &job.workflow_run_id,
                    RunInfoLevel::Warning,
                    format!(
                        "Job \"{}\" has been cancelled by concurrency rule \"{rule_name}\"",
                        job.job_id
                    ),
                ))
                .await?;
            }
        }
        applied.cancelled.push(object.to_ref());
    }

    Ok(applied)
}

fn rule_not_found_message(name: &str) -> String {
    format!("concurrency \"{name}\" not found on workflow nor on project")
}

fn condition_skipped_message(name: &str) -> String {
    format!("Concurrency \"{name}\" skipped")
}

fn invalid_condition_message(
    rule: &WorkflowConcurrency,
    error: &crate::concurrency::ConditionError,
) -> String {
    format!(
        "unable to interpolate concurrency \"{}\" condition \"{}\": {error}",
        rule.name,
        normalize_condition(rule.if_condition.as_deref().unwrap_or_default())
    )
}
