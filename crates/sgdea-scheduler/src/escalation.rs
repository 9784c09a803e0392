//! Escalation of overdue workflow tasks up a static hierarchy.
//!
//! Target order: the task's explicit target (first escalation only), the
//! assignee's supervisor, then the first active user holding the fallback
//! role. A task with no target, or already at the level cap, is marked failed.
//! Either way it leaves the overdue set, so a rerun does not touch it again
//! until its new deadline passes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use sgdea_core::config::EscalationConfig;
use sgdea_core::error::Result;
use sgdea_core::traits::{UserDirectory, WorkflowStore};
use sgdea_core::types::{
    EntityKind, EntityRef, NewAuditEntry, NewNotification, Priority, UserId, WorkflowState,
    WorkflowTask,
};

use crate::materialize::Materializer;
use crate::report::BatchSummary;

/// Notification type sent to the new assignee.
pub const ESCALATED_NOTIFICATION: &str = "tarea_escalada";

/// What happened to one overdue task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    Escalated,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationOutcome {
    pub task_id: i64,
    pub action: EscalationAction,
    pub from: UserId,
    pub to: Option<UserId>,
    pub level: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationReport {
    pub summary: BatchSummary,
    pub outcomes: Vec<EscalationOutcome>,
}

/// Pick the next assignee for `task`, if anyone qualifies.
pub fn resolve_target(
    directory: &dyn UserDirectory,
    task: &WorkflowTask,
    fallback_role: &str,
) -> Result<Option<UserId>> {
    let active = |id: UserId| -> Result<bool> {
        Ok(id != task.assignee_id && directory.user(id)?.is_some_and(|u| u.active))
    };

    if task.escalation_level == 0
        && let Some(target) = task.escalation_target_id
        && active(target)?
    {
        return Ok(Some(target));
    }
    if let Some(assignee) = directory.user(task.assignee_id)?
        && let Some(supervisor) = assignee.supervisor_id
        && active(supervisor)?
    {
        return Ok(Some(supervisor));
    }
    Ok(directory
        .users_with_role(fallback_role)?
        .into_iter()
        .find(|u| u.id != task.assignee_id)
        .map(|u| u.id))
}

/// Escalate every overdue task. One task's failure never stops the batch.
pub fn escalate_overdue(
    store: &dyn WorkflowStore,
    directory: &dyn UserDirectory,
    materializer: &Materializer<'_>,
    policy: &EscalationConfig,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<EscalationReport> {
    let overdue = store.overdue_tasks(now)?;
    tracing::info!("⏰ {} overdue task(s)", overdue.len());

    let mut summary = BatchSummary::new("escalate", dry_run, now);
    let mut outcomes = Vec::with_capacity(overdue.len());
    for task in overdue {
        let label = format!("workflow_task#{}", task.id);
        let result = escalate_one(store, directory, materializer, policy, &task, now, dry_run);
        let result = result.map(|outcome| {
            let escalated = outcome.action == EscalationAction::Escalated;
            outcomes.push(outcome);
            escalated
        });
        summary.record(label, result);
    }
    summary.finish(now);
    Ok(EscalationReport { summary, outcomes })
}

fn escalate_one(
    store: &dyn WorkflowStore,
    directory: &dyn UserDirectory,
    materializer: &Materializer<'_>,
    policy: &EscalationConfig,
    task: &WorkflowTask,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<EscalationOutcome> {
    let target = if task.escalation_level < policy.max_levels {
        resolve_target(directory, task, &policy.fallback_role)?
    } else {
        None
    };

    let mut updated = task.clone();
    let outcome = match target {
        Some(to) => {
            updated.assignee_id = to;
            updated.status = WorkflowState::Escalated;
            updated.escalation_level += 1;
            updated.escalated_at = Some(now);
            updated.deadline = now + Duration::hours(i64::from(policy.extension_hours));
            EscalationOutcome {
                task_id: task.id,
                action: EscalationAction::Escalated,
                from: task.assignee_id,
                to: Some(to),
                level: updated.escalation_level,
            }
        }
        None => {
            updated.status = WorkflowState::Failed;
            EscalationOutcome {
                task_id: task.id,
                action: EscalationAction::Failed,
                from: task.assignee_id,
                to: None,
                level: task.escalation_level,
            }
        }
    };

    if dry_run {
        return Ok(outcome);
    }

    let audit = NewAuditEntry {
        event_type: match outcome.action {
            EscalationAction::Escalated => "task_escalated".into(),
            EscalationAction::Failed => "task_escalation_failed".into(),
        },
        actor: "system".into(),
        subject: format!("workflow_task:{}", task.id),
        details: Some(
            serde_json::json!({
                "from": outcome.from,
                "to": outcome.to,
                "level": outcome.level,
                "previous_deadline": task.deadline,
            })
            .to_string(),
        ),
    };
    store.apply_escalation(&updated, &audit, now)?;

    match outcome.to {
        Some(to) => {
            tracing::info!(
                "⬆️ Task #{} '{}' escalated from user {} to user {} (level {})",
                task.id,
                task.name,
                task.assignee_id,
                to,
                outcome.level
            );
            let notice = NewNotification {
                user_id: to,
                notification_type: ESCALATED_NOTIFICATION.into(),
                title: format!("Tarea \"{}\" escalada", task.name),
                message: format!(
                    "La tarea del flujo #{} se le asignó por vencimiento; nuevo plazo {}",
                    task.instance_id,
                    updated.deadline.format("%Y-%m-%d %H:%M")
                ),
                priority: Priority::High,
                is_automatic: true,
                entity: Some(EntityRef::new(EntityKind::WorkflowTask, task.id)),
            };
            let window = Duration::hours(i64::from(policy.extension_hours));
            if let Err(e) = materializer.notify(&notice, window, now, false) {
                tracing::warn!("⚠️ Escalation notice for task #{} not created: {e}", task.id);
            }
        }
        None => tracing::warn!(
            "⚠️ Task #{} '{}' could not be escalated (level {}), marked failed",
            task.id,
            task.name,
            task.escalation_level
        ),
    }
    Ok(outcome)
}
