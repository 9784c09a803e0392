//! Retention housekeeping: purge old notifications, archive finished workflows.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use sgdea_core::config::RetentionConfig;
use sgdea_core::error::Result;
use sgdea_core::traits::{NotificationStore, PurgeRule, WorkflowStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    /// Archive completed workflow instances too. Callers confirm this first.
    pub archive_workflows: bool,
    pub dry_run: bool,
}

/// Rows affected (or, in a dry run, matched) per step.
///
/// Dry-run counts are taken per rule independently, so a row matching two
/// rules is counted twice.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub archived_deleted: usize,
    pub read_deleted: usize,
    pub non_critical_deleted: usize,
    /// `None` when workflow archival did not run.
    pub workflows_archived: Option<usize>,
    pub ran_at: Option<DateTime<Utc>>,
}

impl CleanupReport {
    pub fn notifications_deleted(&self) -> usize {
        self.archived_deleted + self.read_deleted + self.non_critical_deleted
    }
}

impl std::fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "cleanup{}", if self.dry_run { " (dry run)" } else { "" })?;
        writeln!(f, "  {:<22} {:>6}", "archived notifications", self.archived_deleted)?;
        writeln!(f, "  {:<22} {:>6}", "read notifications", self.read_deleted)?;
        writeln!(f, "  {:<22} {:>6}", "non-critical", self.non_critical_deleted)?;
        match self.workflows_archived {
            Some(n) => write!(f, "  {:<22} {:>6}", "workflows archived", n),
            None => write!(f, "  {:<22} {:>6}", "workflows archived", "-"),
        }
    }
}

fn cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(days))
}

/// Run every retention step in order. The first failing step aborts the run.
pub fn cleanup(
    notifications: &dyn NotificationStore,
    workflows: &dyn WorkflowStore,
    policy: &RetentionConfig,
    options: CleanupOptions,
    now: DateTime<Utc>,
) -> Result<CleanupReport> {
    let dry_run = options.dry_run;
    let mut report = CleanupReport {
        dry_run,
        ..Default::default()
    };

    report.archived_deleted =
        notifications.purge(PurgeRule::Archived, cutoff(now, policy.archived_days), dry_run)?;
    report.read_deleted =
        notifications.purge(PurgeRule::Read, cutoff(now, policy.read_days), dry_run)?;
    report.non_critical_deleted = notifications.purge(
        PurgeRule::NonCritical,
        cutoff(now, policy.non_critical_days),
        dry_run,
    )?;
    tracing::info!(
        "🧹 Notifications {}: archived={} read={} non_critical={}",
        if dry_run { "matched" } else { "deleted" },
        report.archived_deleted,
        report.read_deleted,
        report.non_critical_deleted
    );

    if options.archive_workflows {
        let n = workflows.archive_completed_instances(
            cutoff(now, policy.workflow_archive_days),
            now,
            dry_run,
        )?;
        tracing::info!("🗄️ Workflow instances archived: {n}");
        report.workflows_archived = Some(n);
    }

    report.ran_at = Some(now);
    Ok(report)
}
