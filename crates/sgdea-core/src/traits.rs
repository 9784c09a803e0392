//! Repository and delivery traits.
//!
//! The jobs are written against these seams instead of querying a global
//! connection, so each job can be exercised against any store and with fake
//! delivery channels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    AuditEntry, Certificado, Expediente, LifecycleStage, NewAuditEntry, NewNotification,
    Notification, NotificationStatus, Prestamo, Priority, User, UserId, WorkflowState,
    WorkflowTask,
};

/// Read access to users and roles.
pub trait UserDirectory {
    /// Look up a user by id.
    fn user(&self, id: UserId) -> Result<Option<User>>;

    /// Active users holding `role`, ordered by id.
    fn users_with_role(&self, role: &str) -> Result<Vec<User>>;
}

/// Which notifications a retention purge removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeRule {
    /// Archived notifications.
    Archived,
    /// Read notifications.
    Read,
    /// Anything below critical priority, whatever its status.
    NonCritical,
}

/// Persistence for notifications.
pub trait NotificationStore {
    /// Insert `new` unless a notification with the same type, entity and
    /// recipient was created at or after `window_start`. Returns the new id,
    /// or `None` when a recent one already exists.
    fn insert_unless_recent(
        &self,
        new: &NewNotification,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>>;

    /// Whether `insert_unless_recent` would skip `new` for this window.
    fn has_recent(&self, new: &NewNotification, window_start: DateTime<Utc>) -> Result<bool>;

    /// Pending notifications with one of `priorities`, created strictly after `since`.
    /// Back-to-back windows therefore never share a notification.
    fn dispatch_candidates(
        &self,
        priorities: &[Priority],
        since: DateTime<Utc>,
    ) -> Result<Vec<Notification>>;

    /// A user's notifications, newest first.
    fn list_for_user(
        &self,
        user_id: UserId,
        status: Option<NotificationStatus>,
    ) -> Result<Vec<Notification>>;

    /// pending → read. Returns false when the transition does not apply.
    fn mark_read(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// pending|read → archived. Returns false when the transition does not apply.
    fn archive(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Delete (or count, when `dry_run`) notifications matching `rule`
    /// created strictly before `cutoff`.
    fn purge(&self, rule: PurgeRule, cutoff: DateTime<Utc>, dry_run: bool) -> Result<usize>;
}

/// Read-only queries backing the trigger predicates.
pub trait TriggerSource {
    /// Non-deleted case files in `stage` with `after < opened_at <= until`.
    fn expedientes_opened_between(
        &self,
        stage: LifecycleStage,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Expediente>>;

    /// Active loans with `from <= due_at < until`.
    fn active_loans_due_between(
        &self,
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Prestamo>>;

    /// Certificates stored as valid with `from <= valid_to < until`.
    fn valid_certificates_expiring_between(
        &self,
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Certificado>>;

    /// Tasks in one of `statuses` with `from <= deadline < until`.
    fn tasks_due_between(
        &self,
        statuses: &[WorkflowState],
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WorkflowTask>>;
}

/// Workflow persistence used by escalation and housekeeping.
pub trait WorkflowStore {
    /// Escalatable tasks whose deadline is before `now`.
    fn overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowTask>>;

    /// Persist an escalated (or failed) task together with its audit entry, atomically.
    fn apply_escalation(
        &self,
        task: &WorkflowTask,
        audit: &NewAuditEntry,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Archive (or count, when `dry_run`) completed instances finished before `cutoff`.
    fn archive_completed_instances(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize>;
}

/// Append-only audit trail.
pub trait AuditLog {
    fn log_event(&self, entry: &NewAuditEntry, now: DateTime<Utc>) -> Result<i64>;

    /// Most recent entries first.
    fn recent_events(&self, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// Outbound e-mail collaborator.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send `notification` to `to`. `Ok(false)` means the transport declined it.
    async fn send_notification(&self, to: &str, notification: &Notification) -> Result<bool>;
}

/// Outbound SMS collaborator.
#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Send `text` to `phone`. `Ok(false)` means the gateway declined it.
    async fn send_sms(&self, phone: &str, text: &str) -> Result<bool>;
}
