// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrency admission control.
//!
//! Runs and job runs that reference the same named rule compete for the
//! rule's pool, counted per workflow or per project depending on the rule
//! scope. This module decides who holds a slot:
//!
//! - [`check_workflow_scoped_concurrency`] / [`check_project_scoped_concurrency`]
//!   report how many objects are building and blocked under a rule.
//! - [`retrieve_run_objects_to_unlock`] computes which blocked objects to
//!   release and, for `cancel-in-progress` rules, which older objects to cancel.
//!
//! The functions only read. Callers apply the decision in the same
//! [`UnitOfWork`], after [`UnitOfWork::lock_concurrency_group`], so two
//! decisions for the same rule cannot interleave.

use std::cmp::Ordering;

use cds_core::persistence::UnitOfWork;
use cds_core::types::{
    ConcurrencyObject, ConcurrencyOrder, ConcurrencyScope, ConcurrencyScopeKey,
    WorkflowConcurrency, WorkflowRef,
};
use tracing::debug;

use crate::error::Result;

/// Occupancy of a rule within its scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConcurrencyStatus {
    /// Rule declared by the earliest object in scope; `None` when nothing
    /// in scope uses the rule.
    pub rule: Option<WorkflowConcurrency>,
    /// Objects holding a slot.
    pub building: usize,
    /// Objects waiting for a slot.
    pub blocked: usize,
}

/// Outcome of an admission pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConcurrencyDecision {
    /// Effective rule the decision was computed with.
    pub rule: Option<WorkflowConcurrency>,
    /// Objects still holding a slot after the decision (cancelled ones excluded).
    pub building: usize,
    /// Blocked objects to release, in release order.
    pub to_unlock: Vec<ConcurrencyObject>,
    /// Objects to stop, oldest first.
    pub to_cancel: Vec<ConcurrencyObject>,
}

impl ConcurrencyDecision {
    /// Whether the decision changes nothing.
    pub fn is_empty(&self) -> bool {
        self.to_unlock.is_empty() && self.to_cancel.is_empty()
    }
}

/// Count building and blocked objects of a workflow-scoped rule.
pub async fn check_workflow_scoped_concurrency(
    uow: &mut dyn UnitOfWork,
    project_key: &str,
    workflow: &WorkflowRef,
    rule: &WorkflowConcurrency,
) -> Result<ConcurrencyStatus> {
    let key = ConcurrencyScopeKey::workflow(project_key, workflow.clone(), &rule.name);
    let objects = uow.load_concurrency_objects(&key).await?;
    Ok(concurrency_status(&objects))
}

/// Count building and blocked objects of a project-scoped rule.
pub async fn check_project_scoped_concurrency(
    uow: &mut dyn UnitOfWork,
    project_key: &str,
    rule: &WorkflowConcurrency,
) -> Result<ConcurrencyStatus> {
    let key = ConcurrencyScopeKey::project(project_key, &rule.name);
    let objects = uow.load_concurrency_objects(&key).await?;
    Ok(concurrency_status(&objects))
}

/// Compute which objects of a rule group to unlock and which to cancel.
pub async fn retrieve_run_objects_to_unlock(
    uow: &mut dyn UnitOfWork,
    key: &ConcurrencyScopeKey,
) -> Result<ConcurrencyDecision> {
    let objects = uow.load_concurrency_objects(key).await?;
    let decision = plan_admission(objects);

    debug!(
        rule = %key,
        building = decision.building,
        to_unlock = decision.to_unlock.len(),
        to_cancel = decision.to_cancel.len(),
        "Computed concurrency decision"
    );

    Ok(decision)
}

/// Occupancy of a set of objects loaded for one rule group.
pub fn concurrency_status(objects: &[ConcurrencyObject]) -> ConcurrencyStatus {
    ConcurrencyStatus {
        rule: effective_rule(objects),
        building: objects.iter().filter(|o| o.is_building()).count(),
        blocked: objects.iter().filter(|o| o.is_blocked()).count(),
    }
}

/// The rule declared by the earliest object, normalized.
///
/// Objects are expected in load order (runs then jobs, each by insertion);
/// equal timestamps keep that order.
pub fn effective_rule(objects: &[ConcurrencyObject]) -> Option<WorkflowConcurrency> {
    objects
        .iter()
        .enumerate()
        .filter(|(_, o)| o.rule().is_some())
        .min_by(|(ia, a), (ib, b)| a.timestamp().cmp(&b.timestamp()).then(ia.cmp(ib)))
        .and_then(|(_, o)| o.rule().cloned())
        .map(WorkflowConcurrency::normalized)
}

/// Admission decision for the objects of one rule group.
///
/// Without `cancel-in-progress`, blocked objects are released in rule order
/// while the pool has free slots. With it, the `pool` most recent objects
/// (building or blocked) keep or take a slot and every older one is cancelled.
/// A group without blocked objects yields an empty decision.
pub fn plan_admission(objects: Vec<ConcurrencyObject>) -> ConcurrencyDecision {
    let Some(rule) = effective_rule(&objects) else {
        return ConcurrencyDecision::default();
    };

    let building = objects.iter().filter(|o| o.is_building()).count();
    if !objects.iter().any(|o| o.is_blocked()) {
        return ConcurrencyDecision {
            rule: Some(rule),
            building,
            ..Default::default()
        };
    }

    let pool = rule.pool_size();

    if !rule.cancel_in_progress {
        let mut blocked: Vec<ConcurrencyObject> =
            objects.into_iter().filter(|o| o.is_blocked()).collect();
        sort_by_order(&mut blocked, rule.order);
        blocked.truncate(pool.saturating_sub(building));

        return ConcurrencyDecision {
            rule: Some(rule),
            building,
            to_unlock: blocked,
            to_cancel: Vec::new(),
        };
    }

    // Most recent first; later insertion wins exact ties.
    let mut candidates: Vec<(usize, ConcurrencyObject)> = objects
        .into_iter()
        .enumerate()
        .filter(|(_, o)| o.is_building() || o.is_blocked())
        .collect();
    candidates.sort_by(|(ia, a), (ib, b)| recency(b, *ib, a, *ia));

    let mut older = candidates.split_off(pool.min(candidates.len()));

    let mut still_building = 0;
    let mut kept_blocked = Vec::new();
    for (index, object) in candidates {
        if object.is_blocked() {
            kept_blocked.push((index, object));
        } else {
            still_building += 1;
        }
    }
    // Back to load order so equal timestamps release in load order.
    kept_blocked.sort_by_key(|(index, _)| *index);
    let mut to_unlock: Vec<ConcurrencyObject> =
        kept_blocked.into_iter().map(|(_, o)| o).collect();
    sort_by_order(&mut to_unlock, rule.order);

    older.sort_by(|(ia, a), (ib, b)| recency(a, *ia, b, *ib));
    let to_cancel = older.into_iter().map(|(_, o)| o).collect();

    ConcurrencyDecision {
        rule: Some(rule),
        building: still_building,
        to_unlock,
        to_cancel,
    }
}

/// Find the definition of `name`: workflow definitions first, then project
/// definitions. The scope of the returned rule reflects where it was found.
pub fn resolve_concurrency_definition(
    workflow_definitions: &[WorkflowConcurrency],
    project_definitions: &[WorkflowConcurrency],
    name: &str,
) -> Option<WorkflowConcurrency> {
    if let Some(rule) = workflow_definitions.iter().find(|r| r.name == name) {
        let mut rule = rule.clone().normalized();
        rule.scope = ConcurrencyScope::Workflow;
        return Some(rule);
    }

    project_definitions.iter().find(|r| r.name == name).map(|rule| {
        let mut rule = rule.clone().normalized();
        rule.scope = ConcurrencyScope::Project;
        rule
    })
}

/// A rule condition that cannot be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    /// Only the literals `true` and `false` are understood.
    #[error("unsupported expression {0:?}")]
    Unsupported(String),
}

/// Condition text as shown to users: always wrapped in `${{ }}`.
pub fn normalize_condition(condition: &str) -> String {
    let trimmed = condition.trim();
    if trimmed.starts_with("${{") {
        trimmed.to_string()
    } else {
        format!("${{{{ {trimmed} }}}}")
    }
}

/// Evaluate the `if` condition of a rule.
///
/// A rule without a condition always applies. Conditions are literal
/// booleans, with or without the `${{ }}` wrapper.
pub fn concurrency_condition_applies(
    rule: &WorkflowConcurrency,
) -> std::result::Result<bool, ConditionError> {
    let Some(condition) = rule.if_condition.as_deref() else {
        return Ok(true);
    };

    let trimmed = condition.trim();
    let expression = trimmed
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .unwrap_or(trimmed)
        .trim();

    if expression.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if expression.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ConditionError::Unsupported(expression.to_string()))
    }
}

/// Stable sort by release order. Equal timestamps keep the input order.
fn sort_by_order(objects: &mut [ConcurrencyObject], order: ConcurrencyOrder) {
    match order {
        ConcurrencyOrder::OldestFirst => objects.sort_by_key(|o| o.timestamp()),
        ConcurrencyOrder::NewestFirst => {
            objects.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()))
        }
    }
}

fn recency(a: &ConcurrencyObject, ia: usize, b: &ConcurrencyObject, ib: usize) -> Ordering {
    a.timestamp().cmp(&b.timestamp()).then(ia.cmp(&ib))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cds_core::types::{
        ConcurrencyObjectType, JobDefinition, JobStatus, RunStatus, WorkflowRun, WorkflowRunJob,
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn rule(pool: i64, order: ConcurrencyOrder, cancel: bool) -> WorkflowConcurrency {
        let mut rule = WorkflowConcurrency::new("deploy");
        rule.pool = pool;
        rule.order = order;
        rule.cancel_in_progress = cancel;
        rule
    }

    fn run(id: &str, status: RunStatus, at: i64, rule: &WorkflowConcurrency) -> ConcurrencyObject {
        let wf = WorkflowRef::new("github", "ovh/cds", "build");
        let mut run = WorkflowRun::new("PROJ", &wf, 1, "admin");
        run.id = id.to_string();
        run.status = status;
        run.last_modified = t(at);
        run.concurrency = Some(rule.clone());
        ConcurrencyObject::Workflow(run)
    }

    fn job(id: &str, status: JobStatus, at: i64, rule: &WorkflowConcurrency) -> ConcurrencyObject {
        let wf = WorkflowRef::new("github", "ovh/cds", "build");
        let parent = WorkflowRun::new("PROJ", &wf, 1, "admin");
        let mut job = WorkflowRunJob::for_run(&parent, id, JobDefinition::default());
        job.id = id.to_string();
        job.status = status;
        job.queued = t(at);
        job.concurrency = Some(rule.clone());
        ConcurrencyObject::Job(job)
    }

    fn conditional(condition: &str) -> WorkflowConcurrency {
        let mut rule = WorkflowConcurrency::new("deploy");
        rule.if_condition = Some(condition.to_string());
        rule
    }

    #[test]
    fn test_cancel_in_progress_releases_ties_in_load_order() {
        let r = rule(2, ConcurrencyOrder::OldestFirst, true);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Blocked, 5, &r),
            run("r2", RunStatus::Blocked, 5, &r),
            job("j1", JobStatus::Blocked, 1, &r),
        ]);
        assert_eq!(ids(&decision.to_unlock), vec!["r1", "r2"]);
        assert_eq!(ids(&decision.to_cancel), vec!["j1"]);
    }

    #[test]
    fn test_condition_literals() {
        assert_eq!(concurrency_condition_applies(&WorkflowConcurrency::new("deploy")), Ok(true));
        assert_eq!(concurrency_condition_applies(&conditional("true")), Ok(true));
        assert_eq!(concurrency_condition_applies(&conditional("${{ false }}")), Ok(false));
        assert_eq!(concurrency_condition_applies(&conditional(" ${{false}} ")), Ok(false));
        assert_eq!(concurrency_condition_applies(&conditional("FALSE")), Ok(false));
        assert_eq!(
            concurrency_condition_applies(&conditional("${{ git.ref == 'main' }}")),
            Err(ConditionError::Unsupported("git.ref == 'main'".to_string()))
        );
    }

    #[test]
    fn test_normalize_condition_wraps_bare_expressions() {
        assert_eq!(normalize_condition("false"), "${{ false }}");
        assert_eq!(normalize_condition("${{ true }}"), "${{ true }}");
    }

    fn ids(objects: &[ConcurrencyObject]) -> Vec<&str> {
        objects.iter().map(|o| o.id()).collect()
    }

    #[test]
    fn test_empty_group_has_no_constraint() {
        let decision = plan_admission(Vec::new());
        assert!(decision.rule.is_none());
        assert!(decision.is_empty());

        let status = concurrency_status(&[]);
        assert_eq!(status, ConcurrencyStatus::default());
    }

    #[test]
    fn test_no_blocked_objects_yields_empty_decision() {
        let r = rule(1, ConcurrencyOrder::OldestFirst, true);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Building, 0, &r),
            run("r2", RunStatus::Building, 1, &r),
        ]);
        assert!(decision.is_empty());
        assert_eq!(decision.building, 2);
    }

    #[test]
    fn test_effective_rule_comes_from_earliest_object() {
        let early = rule(2, ConcurrencyOrder::NewestFirst, false);
        let late = rule(5, ConcurrencyOrder::OldestFirst, true);

        let objects = vec![
            job("j1", JobStatus::Blocked, 10, &late),
            run("r1", RunStatus::Blocked, 3, &early),
        ];
        let effective = effective_rule(&objects).unwrap();
        assert_eq!(effective.pool, 2);
        assert_eq!(effective.order, ConcurrencyOrder::NewestFirst);
    }

    #[test]
    fn test_effective_rule_is_normalized() {
        let r = rule(0, ConcurrencyOrder::OldestFirst, false);
        let objects = vec![run("r1", RunStatus::Blocked, 0, &r)];
        assert_eq!(effective_rule(&objects).unwrap().pool, 1);

        let decision = plan_admission(objects);
        assert_eq!(ids(&decision.to_unlock), vec!["r1"]);
    }

    #[test]
    fn test_status_counts() {
        let r = rule(3, ConcurrencyOrder::OldestFirst, false);
        let status = concurrency_status(&[
            run("r1", RunStatus::Building, 0, &r),
            job("j1", JobStatus::Scheduling, 1, &r),
            job("j2", JobStatus::Blocked, 2, &r),
        ]);
        assert_eq!(status.building, 2);
        assert_eq!(status.blocked, 1);
        assert_eq!(status.rule.unwrap().pool, 3);
    }

    #[test]
    fn test_oldest_first_unlocks_in_ascending_order() {
        let r = rule(3, ConcurrencyOrder::OldestFirst, false);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Blocked, 0, &r),
            job("j1", JobStatus::Blocked, 1, &r),
            job("j2", JobStatus::Blocked, 2, &r),
            job("j3", JobStatus::Blocked, 3, &r),
        ]);

        assert_eq!(ids(&decision.to_unlock), vec!["r1", "j1", "j2"]);
        assert!(decision.to_cancel.is_empty());
        assert_eq!(
            decision.to_unlock[0].object_type(),
            ConcurrencyObjectType::Workflow
        );
        let stamps: Vec<_> = decision.to_unlock.iter().map(|o| o.timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_newest_first_unlocks_in_descending_order() {
        let r = rule(3, ConcurrencyOrder::NewestFirst, false);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Blocked, 10, &r),
            job("j1", JobStatus::Blocked, 1, &r),
            job("j2", JobStatus::Blocked, 2, &r),
            job("j3", JobStatus::Blocked, 3, &r),
        ]);

        assert_eq!(ids(&decision.to_unlock), vec!["r1", "j3", "j2"]);
        let stamps: Vec<_> = decision.to_unlock.iter().map(|o| o.timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_building_objects_consume_pool() {
        let r = rule(3, ConcurrencyOrder::OldestFirst, false);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Building, 0, &r),
            job("j1", JobStatus::Waiting, 1, &r),
            job("j2", JobStatus::Blocked, 2, &r),
            job("j3", JobStatus::Blocked, 3, &r),
        ]);

        assert_eq!(ids(&decision.to_unlock), vec!["j2"]);
        assert!(decision.to_unlock.len() + decision.building <= 3);
    }

    #[test]
    fn test_full_pool_unlocks_nothing() {
        let r = rule(1, ConcurrencyOrder::OldestFirst, false);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Building, 0, &r),
            run("r2", RunStatus::Building, 1, &r),
            run("r3", RunStatus::Blocked, 2, &r),
        ]);

        assert!(decision.to_unlock.is_empty());
        assert!(decision.to_cancel.is_empty());
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let r = rule(2, ConcurrencyOrder::NewestFirst, false);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Blocked, 5, &r),
            job("j1", JobStatus::Blocked, 5, &r),
            job("j2", JobStatus::Blocked, 5, &r),
        ]);
        assert_eq!(ids(&decision.to_unlock), vec!["r1", "j1"]);
    }

    #[test]
    fn test_cancel_in_progress_cancels_oldest_beyond_pool() {
        let mut r = rule(2, ConcurrencyOrder::OldestFirst, true);
        r.scope = ConcurrencyScope::Project;
        let decision = plan_admission(vec![
            run("r-old", RunStatus::Blocked, 0, &r),
            job("j1", JobStatus::Building, 1, &r),
            job("j2", JobStatus::Blocked, 2, &r),
            job("j3", JobStatus::Blocked, 3, &r),
        ]);

        assert_eq!(ids(&decision.to_unlock), vec!["j2", "j3"]);
        assert_eq!(ids(&decision.to_cancel), vec!["r-old", "j1"]);
        assert_eq!(decision.building, 0);
    }

    #[test]
    fn test_cancel_in_progress_keeps_recent_building_object() {
        let r = rule(2, ConcurrencyOrder::OldestFirst, true);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Building, 0, &r),
            run("r2", RunStatus::Building, 1, &r),
            run("r3", RunStatus::Blocked, 2, &r),
        ]);

        assert_eq!(ids(&decision.to_unlock), vec!["r3"]);
        assert_eq!(ids(&decision.to_cancel), vec!["r1"]);
        assert_eq!(decision.building, 1);
        assert!(decision.to_unlock.len() + decision.building <= 2);
    }

    #[test]
    fn test_cancel_in_progress_false_never_cancels() {
        let r = rule(1, ConcurrencyOrder::NewestFirst, false);
        let decision = plan_admission(vec![
            run("r1", RunStatus::Building, 0, &r),
            run("r2", RunStatus::Blocked, 5, &r),
            run("r3", RunStatus::Blocked, 9, &r),
        ]);
        assert!(decision.to_cancel.is_empty());
        assert!(decision.to_unlock.is_empty());
    }

    #[test]
    fn test_resolve_definition_prefers_workflow() {
        let mut on_workflow = WorkflowConcurrency::new("deploy");
        on_workflow.pool = 2;
        let mut on_project = WorkflowConcurrency::new("deploy");
        on_project.pool = 9;
        let shared = WorkflowConcurrency::new("shared");

        let found = resolve_concurrency_definition(
            &[on_workflow],
            &[on_project, shared],
            "deploy",
        )
        .unwrap();
        assert_eq!(found.pool, 2);
        assert_eq!(found.scope, ConcurrencyScope::Workflow);

        let found = resolve_concurrency_definition(&[], &[WorkflowConcurrency::new("shared")], "shared")
            .unwrap();
        assert_eq!(found.scope, ConcurrencyScope::Project);

        assert!(resolve_concurrency_definition(&[], &[], "missing").is_none());
    }
}
