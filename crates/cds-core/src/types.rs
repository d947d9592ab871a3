// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow run model.
//!
//! Runs and job runs are plain value types: the persistence layer returns them
//! fully populated and never lazy-loads anything behind the caller's back.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ============================================================================
// Statuses
// ============================================================================

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// The run is being crafted (definitions resolved, concurrency not yet applied).
    Crafting,
    /// The run is executing.
    Building,
    /// The run is held by a concurrency rule.
    Blocked,
    /// The run was stopped (by a user or by a concurrency rule).
    Stopped,
    /// The run finished successfully.
    Success,
    /// The run failed.
    Fail,
    /// The run was skipped.
    Skipped,
}

impl RunStatus {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crafting => "Crafting",
            Self::Building => "Building",
            Self::Blocked => "Blocked",
            Self::Stopped => "Stopped",
            Self::Success => "Success",
            Self::Fail => "Fail",
            Self::Skipped => "Skipped",
        }
    }

    /// Whether the run reached a final state.
    pub fn is_terminated(&self) -> bool {
        !matches!(self, Self::Crafting | Self::Building | Self::Blocked)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Crafting" => Ok(Self::Crafting),
            "Building" => Ok(Self::Building),
            "Blocked" => Ok(Self::Blocked),
            "Stopped" => Ok(Self::Stopped),
            "Success" => Ok(Self::Success),
            "Fail" => Ok(Self::Fail),
            "Skipped" => Ok(Self::Skipped),
            other => Err(Error::InvalidValue {
                field: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// Status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Queued, waiting for a worker.
    Waiting,
    /// A worker is being provisioned.
    Scheduling,
    /// A worker is executing the job.
    Building,
    /// Held by a concurrency rule.
    Blocked,
    /// Stopped by a user or by a concurrency rule.
    Stopped,
    /// Finished successfully.
    Success,
    /// Failed.
    Fail,
    /// Skipped.
    Skipped,
}

impl JobStatus {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Scheduling => "Scheduling",
            Self::Building => "Building",
            Self::Blocked => "Blocked",
            Self::Stopped => "Stopped",
            Self::Success => "Success",
            Self::Fail => "Fail",
            Self::Skipped => "Skipped",
        }
    }

    /// Whether the job occupies a concurrency slot (admitted and not finished).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Scheduling | Self::Building)
    }

    /// Whether the job reached a final state.
    pub fn is_terminated(&self) -> bool {
        !self.is_active() && *self != Self::Blocked
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(Self::Waiting),
            "Scheduling" => Ok(Self::Scheduling),
            "Building" => Ok(Self::Building),
            "Blocked" => Ok(Self::Blocked),
            "Stopped" => Ok(Self::Stopped),
            "Success" => Ok(Self::Success),
            "Fail" => Ok(Self::Fail),
            "Skipped" => Ok(Self::Skipped),
            other => Err(Error::InvalidValue {
                field: "job status",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Concurrency rules
// ============================================================================

/// Order in which blocked objects are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConcurrencyOrder {
    /// Release the object waiting the longest first.
    #[default]
    #[serde(rename = "oldest_first", alias = "oldest-first")]
    OldestFirst,
    /// Release the most recently submitted object first.
    #[serde(rename = "newest_first", alias = "newest-first")]
    NewestFirst,
}

impl ConcurrencyOrder {
    /// String representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OldestFirst => "oldest_first",
            Self::NewestFirst => "newest_first",
        }
    }
}

/// Boundary within which a rule's pool is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// Pool shared by runs and jobs of a single workflow.
    #[default]
    Workflow,
    /// Pool shared across the whole project.
    Project,
}

impl ConcurrencyScope {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Project => "project",
        }
    }
}

impl FromStr for ConcurrencyScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "project" => Ok(Self::Project),
            other => Err(Error::InvalidValue {
                field: "concurrency scope",
                value: other.to_string(),
            }),
        }
    }
}

/// A named concurrency rule.
///
/// Declared on a workflow definition or at project level and attached to the
/// runs and job runs that reference it. The scope is not part of the YAML
/// definition: it is set when the rule is resolved, from where it was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConcurrency {
    /// Rule name, shared by every object gated by the rule.
    pub name: String,
    /// Release order for blocked objects.
    #[serde(default)]
    pub order: ConcurrencyOrder,
    /// Maximum number of concurrently admitted objects.
    #[serde(default)]
    pub pool: i64,
    /// Newer submissions cancel older in-flight objects instead of queueing.
    #[serde(default, rename = "cancel-in-progress")]
    pub cancel_in_progress: bool,
    /// Where the pool is counted.
    #[serde(default)]
    pub scope: ConcurrencyScope,
    /// Condition under which the rule applies, as written in the definition.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_condition: Option<String>,
}

impl WorkflowConcurrency {
    /// Create a rule with default order and a pool of one.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: ConcurrencyOrder::OldestFirst,
            pool: 1,
            cancel_in_progress: false,
            scope: ConcurrencyScope::Workflow,
            if_condition: None,
        }
    }

    /// Apply definition defaults: a pool of zero (or less) means one.
    pub fn normalized(mut self) -> Self {
        if self.pool < 1 {
            self.pool = 1;
        }
        self
    }

    /// Pool size as a count.
    pub fn pool_size(&self) -> usize {
        self.pool.max(1) as usize
    }
}

// ============================================================================
// Runs and job runs
// ============================================================================

/// Identifies a workflow inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowRef {
    /// VCS server name.
    pub vcs_server: String,
    /// Repository identifier.
    pub repository: String,
    /// Workflow name.
    pub workflow_name: String,
}

impl WorkflowRef {
    /// Create a workflow reference.
    pub fn new(
        vcs_server: impl Into<String>,
        repository: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            vcs_server: vcs_server.into(),
            repository: repository.into(),
            workflow_name: workflow_name.into(),
        }
    }

    /// `vcs/repository/workflow`, the name retention patterns match against.
    pub fn full_name(&self) -> String {
        format!(
            "{}/{}/{}",
            self.vcs_server, self.repository, self.workflow_name
        )
    }
}

/// Definition data captured when the run was triggered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunData {
    /// Name of the concurrency rule gating the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<String>,
    /// Concurrency rules declared by the workflow definition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrencies: Vec<WorkflowConcurrency>,
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Insertion order, assigned by the store.
    #[serde(skip)]
    pub seq: i64,
    /// Unique identifier.
    pub id: String,
    /// Owning project.
    pub project_key: String,
    /// VCS server of the workflow repository.
    pub vcs_server: String,
    /// Workflow repository.
    pub repository: String,
    /// Workflow name.
    pub workflow_name: String,
    /// Git ref the run was triggered on.
    #[serde(default)]
    pub git_ref: String,
    /// Run number within the workflow.
    pub run_number: i64,
    /// Attempt number (restarts increment it).
    pub run_attempt: i64,
    /// Current status.
    pub status: RunStatus,
    /// When the run was triggered.
    pub started: DateTime<Utc>,
    /// Last status change.
    pub last_modified: DateTime<Utc>,
    /// User that triggered the run.
    pub username: String,
    /// Definition data.
    pub workflow_data: WorkflowRunData,
    /// Resolved concurrency rule, once applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<WorkflowConcurrency>,
}

impl WorkflowRun {
    /// Create a new run in `Crafting` status.
    pub fn new(
        project_key: impl Into<String>,
        workflow: &WorkflowRef,
        run_number: i64,
        username: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            seq: 0,
            id: Uuid::new_v4().to_string(),
            project_key: project_key.into(),
            vcs_server: workflow.vcs_server.clone(),
            repository: workflow.repository.clone(),
            workflow_name: workflow.workflow_name.clone(),
            git_ref: String::new(),
            run_number,
            run_attempt: 0,
            status: RunStatus::Crafting,
            started: now,
            last_modified: now,
            username: username.into(),
            workflow_data: WorkflowRunData::default(),
            concurrency: None,
        }
    }

    /// The workflow this run belongs to.
    pub fn workflow_ref(&self) -> WorkflowRef {
        WorkflowRef::new(&self.vcs_server, &self.repository, &self.workflow_name)
    }
}

/// Job definition data captured on the job run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name of the concurrency rule gating the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<String>,
}

/// One job execution within a run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunJob {
    /// Insertion order, assigned by the store.
    #[serde(skip)]
    pub seq: i64,
    /// Unique identifier.
    pub id: String,
    /// Parent run.
    pub workflow_run_id: String,
    /// Job key within the workflow graph.
    pub job_id: String,
    /// Owning project.
    pub project_key: String,
    /// VCS server of the workflow repository.
    pub vcs_server: String,
    /// Workflow repository.
    pub repository: String,
    /// Workflow name.
    pub workflow_name: String,
    /// Parent run number.
    pub run_number: i64,
    /// Parent run attempt.
    pub run_attempt: i64,
    /// Current status.
    pub status: JobStatus,
    /// When the job was queued.
    pub queued: DateTime<Utc>,
    /// When a worker picked the job up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the job reached a final state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    /// User that initiated the run.
    pub initiator: String,
    /// Definition data.
    pub job: JobDefinition,
    /// Resolved concurrency rule, once applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<WorkflowConcurrency>,
}

impl WorkflowRunJob {
    /// Create a `Waiting` job run attached to `run`.
    pub fn for_run(run: &WorkflowRun, job_id: impl Into<String>, job: JobDefinition) -> Self {
        Self {
            seq: 0,
            id: Uuid::new_v4().to_string(),
            workflow_run_id: run.id.clone(),
            job_id: job_id.into(),
            project_key: run.project_key.clone(),
            vcs_server: run.vcs_server.clone(),
            repository: run.repository.clone(),
            workflow_name: run.workflow_name.clone(),
            run_number: run.run_number,
            run_attempt: run.run_attempt,
            status: JobStatus::Waiting,
            queued: Utc::now(),
            started: None,
            ended: None,
            initiator: run.username.clone(),
            job,
            concurrency: None,
        }
    }

    /// The workflow this job belongs to.
    pub fn workflow_ref(&self) -> WorkflowRef {
        WorkflowRef::new(&self.vcs_server, &self.repository, &self.workflow_name)
    }
}

// ============================================================================
// Concurrency objects
// ============================================================================

/// Discriminator of a [`ConcurrencyObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyObjectType {
    /// A workflow run.
    Workflow,
    /// A job run.
    Job,
}

/// A run or a job run competing for a concurrency pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "object", rename_all = "snake_case")]
pub enum ConcurrencyObject {
    /// Workflow run.
    Workflow(WorkflowRun),
    /// Job run.
    Job(WorkflowRunJob),
}

impl ConcurrencyObject {
    /// The concrete object type.
    pub fn object_type(&self) -> ConcurrencyObjectType {
        match self {
            Self::Workflow(_) => ConcurrencyObjectType::Workflow,
            Self::Job(_) => ConcurrencyObjectType::Job,
        }
    }

    /// Identifier of the wrapped run or job run.
    pub fn id(&self) -> &str {
        match self {
            Self::Workflow(run) => &run.id,
            Self::Job(job) => &job.id,
        }
    }

    /// Ordering timestamp: last modification for runs, queue time for jobs.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Workflow(run) => run.last_modified,
            Self::Job(job) => job.queued,
        }
    }

    /// Insertion order within the object's own table.
    pub fn seq(&self) -> i64 {
        match self {
            Self::Workflow(run) => run.seq,
            Self::Job(job) => job.seq,
        }
    }

    /// The rule this object declared.
    pub fn rule(&self) -> Option<&WorkflowConcurrency> {
        match self {
            Self::Workflow(run) => run.concurrency.as_ref(),
            Self::Job(job) => job.concurrency.as_ref(),
        }
    }

    /// Whether the object is held by its rule.
    pub fn is_blocked(&self) -> bool {
        match self {
            Self::Workflow(run) => run.status == RunStatus::Blocked,
            Self::Job(job) => job.status == JobStatus::Blocked,
        }
    }

    /// Whether the object currently occupies a pool slot.
    pub fn is_building(&self) -> bool {
        match self {
            Self::Workflow(run) => run.status == RunStatus::Building,
            Self::Job(job) => job.status.is_active(),
        }
    }

    /// Lightweight reference to this object.
    pub fn to_ref(&self) -> ConcurrencyObjectRef {
        ConcurrencyObjectRef {
            id: self.id().to_string(),
            object_type: self.object_type(),
        }
    }
}

/// Reference to a run or job run by id and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyObjectRef {
    /// Run or job run id.
    pub id: String,
    /// Which table the id belongs to.
    #[serde(rename = "type")]
    pub object_type: ConcurrencyObjectType,
}

/// A rule name together with the scope its pool is counted in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConcurrencyScopeKey {
    /// Owning project.
    pub project_key: String,
    /// Workflow for workflow-scoped rules, `None` for project-scoped rules.
    pub workflow: Option<WorkflowRef>,
    /// Rule name.
    pub rule_name: String,
}

impl ConcurrencyScopeKey {
    /// Key of a workflow-scoped rule.
    pub fn workflow(
        project_key: impl Into<String>,
        workflow: WorkflowRef,
        rule_name: impl Into<String>,
    ) -> Self {
        Self {
            project_key: project_key.into(),
            workflow: Some(workflow),
            rule_name: rule_name.into(),
        }
    }

    /// Key of a project-scoped rule.
    pub fn project(project_key: impl Into<String>, rule_name: impl Into<String>) -> Self {
        Self {
            project_key: project_key.into(),
            workflow: None,
            rule_name: rule_name.into(),
        }
    }

    /// Key for `rule` as seen from an object of `workflow` in `project_key`.
    pub fn for_rule(project_key: &str, workflow: WorkflowRef, rule: &WorkflowConcurrency) -> Self {
        match rule.scope {
            ConcurrencyScope::Workflow => Self::workflow(project_key, workflow, &rule.name),
            ConcurrencyScope::Project => Self::project(project_key, &rule.name),
        }
    }

    /// Scope of the key.
    pub fn scope(&self) -> ConcurrencyScope {
        if self.workflow.is_some() {
            ConcurrencyScope::Workflow
        } else {
            ConcurrencyScope::Project
        }
    }

    /// Stable textual key, used in logs and for grouping.
    pub fn unique_key(&self) -> String {
        match &self.workflow {
            Some(wf) => format!(
                "{}/{}/{}/{}/{}",
                self.project_key, wf.vcs_server, wf.repository, wf.workflow_name, self.rule_name
            ),
            None => format!("{}/{}", self.project_key, self.rule_name),
        }
    }
}

impl fmt::Display for ConcurrencyScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_key())
    }
}

// ============================================================================
// Run infos and project rules
// ============================================================================

/// Severity of a run info message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunInfoLevel {
    /// Informational.
    Info,
    /// Something the user should look at.
    Warning,
    /// The run could not proceed.
    Error,
}

impl RunInfoLevel {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for RunInfoLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(Error::InvalidValue {
                field: "run info level",
                value: other.to_string(),
            }),
        }
    }
}

/// Message attached to a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunInfo {
    /// Database id (zero before insertion).
    #[serde(default)]
    pub id: i64,
    /// Run the message belongs to.
    pub workflow_run_id: String,
    /// When the message was issued.
    pub issued_at: DateTime<Utc>,
    /// Severity.
    pub level: RunInfoLevel,
    /// Message text.
    pub message: String,
}

impl WorkflowRunInfo {
    /// Create a message issued now.
    pub fn new(workflow_run_id: impl Into<String>, level: RunInfoLevel, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            workflow_run_id: workflow_run_id.into(),
            issued_at: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

// ============================================================================
// Run retention
// ============================================================================

/// How many runs to keep, and for how long.
///
/// A zero value disables the corresponding criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    /// Runs kept per workflow and git ref, most recent first.
    #[serde(default)]
    pub count: i64,
    /// Terminated runs older than this many days are deleted.
    #[serde(default)]
    pub duration_in_days: i64,
}

impl Default for RetentionRule {
    fn default() -> Self {
        Self {
            count: 50,
            duration_in_days: 90,
        }
    }
}

/// Retention for the git refs of a workflow matching `git_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRefRetention {
    /// Glob pattern matched against the git ref.
    pub git_ref: String,
    /// Rule applied to matching refs.
    pub rule: RetentionRule,
}

/// Retention for workflows whose full name matches `workflow`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRetention {
    /// Glob pattern matched against `vcs/repository/workflow`.
    pub workflow: String,
    /// Rule for refs no entry of `rules` matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_rule: Option<RetentionRule>,
    /// Per-ref rules, first match wins.
    #[serde(default)]
    pub rules: Vec<GitRefRetention>,
}

/// Run retention policy of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRunRetention {
    /// Owning project.
    pub project_key: String,
    /// Rule for workflows no entry of `workflows` matches.
    pub default_rule: RetentionRule,
    /// Per-workflow rules, first match wins.
    #[serde(default)]
    pub workflows: Vec<WorkflowRetention>,
}

impl ProjectRunRetention {
    /// A policy applying `default_rule` everywhere.
    pub fn with_default(project_key: impl Into<String>, default_rule: RetentionRule) -> Self {
        Self {
            project_key: project_key.into(),
            default_rule,
            workflows: Vec::new(),
        }
    }
}
