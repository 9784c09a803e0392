//! Typed entity records shared by the store and the jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SgdeaError;

/// Primary key of a user row.
pub type UserId = i64;

/// Declares a fieldless enum stored as a lowercase string column.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            /// Column value for this variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = SgdeaError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(SgdeaError::InvalidValue(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

string_enum! {
    /// Notification priority, ordered from least to most urgent.
    pub enum Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

string_enum! {
    /// Notification lifecycle.
    pub enum NotificationStatus {
        Pending => "pending",
        Read => "read",
        Archived => "archived",
    }
}

string_enum! {
    /// Kind of record a notification is about.
    pub enum EntityKind {
        Expediente => "expediente",
        Prestamo => "prestamo",
        Certificado => "certificado",
        WorkflowTask => "workflow_task",
    }
}

string_enum! {
    /// Archival lifecycle stage of a case file (`estado_ciclo_vida`).
    pub enum LifecycleStage {
        /// Active management, the stage retention deadlines are counted in.
        Gestion => "gestion",
        Central => "central",
        Historico => "historico",
    }
}

string_enum! {
    /// Loan status.
    pub enum LoanStatus {
        Active => "active",
        Returned => "returned",
    }
}

string_enum! {
    /// Stored certificate state. Expiry is derived, see [`Certificado::effective_state`].
    pub enum CertificateState {
        Valid => "valid",
        Expired => "expired",
        Revoked => "revoked",
        Suspended => "suspended",
    }
}

string_enum! {
    /// State of a workflow instance or one of its approval tasks.
    pub enum WorkflowState {
        Draft => "draft",
        Pending => "pending",
        InReview => "in_review",
        Approved => "approved",
        Rejected => "rejected",
        Completed => "completed",
        /// Overdue task reassigned up the hierarchy.
        Escalated => "escalated",
        /// Overdue task with nobody left to escalate to.
        Failed => "failed",
    }
}

impl WorkflowState {
    /// States in which a task still waits on its assignee.
    pub const OPEN_TASK: [WorkflowState; 3] = [
        WorkflowState::Pending,
        WorkflowState::InReview,
        WorkflowState::Escalated,
    ];

    /// States the overdue escalation scan picks up.
    pub const ESCALATABLE: [WorkflowState; 2] = [WorkflowState::Pending, WorkflowState::Escalated];
}

/// Reference from a notification to the record it concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// A persisted notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: UserId,
    /// Notification type, e.g. `expediente_vencido`.
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub status: NotificationStatus,
    /// Created by a background job rather than a person.
    pub is_automatic: bool,
    pub entity: Option<EntityRef>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Insert payload for a notification. New rows always start `pending`.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: UserId,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub is_automatic: bool,
    pub entity: Option<EntityRef>,
}

/// A system user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Role name, e.g. `admin`, `archivist`, `user`.
    pub role: String,
    /// Next step up the escalation hierarchy.
    pub supervisor_id: Option<UserId>,
    pub active: bool,
}

/// Insert payload for a user.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: String,
    pub supervisor_id: Option<UserId>,
}

/// Case file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expediente {
    pub id: i64,
    pub code: String,
    pub title: String,
    pub responsible_id: Option<UserId>,
    pub lifecycle_stage: LifecycleStage,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Loan of a case file to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prestamo {
    pub id: i64,
    pub expediente_id: i64,
    pub borrower_id: UserId,
    pub status: LoanStatus,
    pub loaned_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
}

/// Signing certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificado {
    pub id: i64,
    pub serial: String,
    pub issuer: String,
    pub subject: String,
    pub owner_id: Option<UserId>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub state: CertificateState,
}

impl Certificado {
    /// State as of `now`: a stored `valid` certificate past `valid_to` reads as expired.
    pub fn effective_state(&self, now: DateTime<Utc>) -> CertificateState {
        match self.state {
            CertificateState::Valid if self.valid_to < now => CertificateState::Expired,
            other => other,
        }
    }
}

/// Workflow instance (one approval process).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: i64,
    pub name: String,
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Approval task within a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: i64,
    pub instance_id: i64,
    pub name: String,
    pub status: WorkflowState,
    pub assignee_id: UserId,
    /// Explicit first escalation target, overriding the supervisor chain.
    pub escalation_target_id: Option<UserId>,
    pub deadline: DateTime<Utc>,
    pub escalation_level: u32,
    pub escalated_at: Option<DateTime<Utc>>,
}

/// Audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: String,
    pub actor: String,
    pub subject: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for an audit entry.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub event_type: String,
    pub actor: String,
    pub subject: String,
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_string_enum_parse() {
        assert_eq!("in_review".parse::<WorkflowState>().unwrap(), WorkflowState::InReview);
        assert_eq!(WorkflowState::InReview.as_str(), "in_review");
        assert_eq!(LifecycleStage::Gestion.to_string(), "gestion");
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_serde_uses_column_names() {
        let json = serde_json::to_string(&EntityKind::WorkflowTask).unwrap();
        assert_eq!(json, "\"workflow_task\"");
    }

    #[test]
    fn test_certificate_effective_state() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let mut cert = Certificado {
            id: 1,
            serial: "01AF".into(),
            issuer: "CN=Root".into(),
            subject: "CN=Firmante".into(),
            owner_id: None,
            valid_from: now - chrono::Duration::days(365),
            valid_to: now - chrono::Duration::seconds(1),
            state: CertificateState::Valid,
        };
        assert_eq!(cert.effective_state(now), CertificateState::Expired);

        cert.valid_to = now;
        assert_eq!(cert.effective_state(now), CertificateState::Valid);

        cert.state = CertificateState::Revoked;
        cert.valid_to = now - chrono::Duration::days(1);
        assert_eq!(cert.effective_state(now), CertificateState::Revoked);
    }
}
