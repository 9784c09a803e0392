//! Trigger scanner: named temporal conditions over records.
//!
//! Every scan is a pure read that recomputes the full matching set against
//! `now`; nothing is remembered between runs.
//!
//! ```text
//! TriggerKind ──scan(source, now)──▶ [TriggerMatch { entity, owner, title, message }]
//!   expediente_vencido          gestion ∧ opened_at <= now − max_age
//!   expediente_proximo_vencer   gestion ∧ opened_at ∈ (now − max_age, now − max_age + warning]
//!   prestamo_vencido            active ∧ due_at < now
//!   prestamo_proximo_vencer     active ∧ due_at ∈ [now, now + warning)
//!   certificado_vencido         valid ∧ valid_to < now
//!   certificado_proximo_vencer  valid ∧ valid_to ∈ [now, now + warning)
//!   tarea_vencida               open ∧ deadline < now
//!   tarea_proxima_vencer        open ∧ deadline ∈ [now, now + warning)
//! ```

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use sgdea_core::config::{NotificationConfig, TriggerConfig};
use sgdea_core::error::{Result, SgdeaError};
use sgdea_core::traits::TriggerSource;
use sgdea_core::types::{
    EntityKind, EntityRef, LifecycleStage, Priority, UserId, WorkflowState,
};

/// A named trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    ExpedienteVencido,
    ExpedienteProximoVencer,
    PrestamoVencido,
    PrestamoProximoVencer,
    CertificadoVencido,
    CertificadoProximoVencer,
    TareaVencida,
    TareaProximaVencer,
}

/// Whether a trigger reports something already late or about to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Overdue,
    Approaching,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 8] = [
        TriggerKind::ExpedienteVencido,
        TriggerKind::ExpedienteProximoVencer,
        TriggerKind::PrestamoVencido,
        TriggerKind::PrestamoProximoVencer,
        TriggerKind::CertificadoVencido,
        TriggerKind::CertificadoProximoVencer,
        TriggerKind::TareaVencida,
        TriggerKind::TareaProximaVencer,
    ];

    /// Notification type written for matches of this trigger.
    pub fn notification_type(&self) -> &'static str {
        match self {
            TriggerKind::ExpedienteVencido => "expediente_vencido",
            TriggerKind::ExpedienteProximoVencer => "expediente_proximo_vencer",
            TriggerKind::PrestamoVencido => "prestamo_vencido",
            TriggerKind::PrestamoProximoVencer => "prestamo_proximo_vencer",
            TriggerKind::CertificadoVencido => "certificado_vencido",
            TriggerKind::CertificadoProximoVencer => "certificado_proximo_vencer",
            TriggerKind::TareaVencida => "tarea_vencida",
            TriggerKind::TareaProximaVencer => "tarea_proxima_vencer",
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            TriggerKind::ExpedienteVencido | TriggerKind::CertificadoVencido => Priority::Critical,
            TriggerKind::ExpedienteProximoVencer
            | TriggerKind::PrestamoVencido
            | TriggerKind::CertificadoProximoVencer
            | TriggerKind::TareaVencida => Priority::High,
            TriggerKind::PrestamoProximoVencer | TriggerKind::TareaProximaVencer => Priority::Medium,
        }
    }

    pub fn urgency(&self) -> Urgency {
        match self {
            TriggerKind::ExpedienteVencido
            | TriggerKind::PrestamoVencido
            | TriggerKind::CertificadoVencido
            | TriggerKind::TareaVencida => Urgency::Overdue,
            _ => Urgency::Approaching,
        }
    }

    /// Dedupe window for this trigger's notifications.
    pub fn dedupe_window(&self, config: &NotificationConfig) -> Duration {
        let days = match self.urgency() {
            Urgency::Overdue => config.overdue_window_days,
            Urgency::Approaching => config.approaching_window_days,
        };
        Duration::days(i64::from(days))
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            TriggerKind::ExpedienteVencido | TriggerKind::ExpedienteProximoVencer => {
                EntityKind::Expediente
            }
            TriggerKind::PrestamoVencido | TriggerKind::PrestamoProximoVencer => EntityKind::Prestamo,
            TriggerKind::CertificadoVencido | TriggerKind::CertificadoProximoVencer => {
                EntityKind::Certificado
            }
            TriggerKind::TareaVencida | TriggerKind::TareaProximaVencer => EntityKind::WorkflowTask,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.notification_type())
    }
}

/// One record currently satisfying a trigger.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub kind: TriggerKind,
    pub entity: EntityRef,
    /// Natural owner of the record, if it has one.
    pub owner: Option<UserId>,
    pub title: String,
    pub message: String,
}

/// Evaluate `kind` against `source` at `now`.
pub fn scan<S>(
    source: &S,
    kind: TriggerKind,
    policy: &TriggerConfig,
    now: DateTime<Utc>,
) -> Result<Vec<TriggerMatch>>
where
    S: TriggerSource + ?Sized,
{
    let matches: Vec<TriggerMatch> = match kind {
        TriggerKind::ExpedienteVencido | TriggerKind::ExpedienteProximoVencer => {
            let max_age_cutoff = now
                .checked_sub_months(Months::new(policy.expediente_max_age_months))
                .ok_or_else(|| SgdeaError::InvalidValue("expediente_max_age_months out of range".into()))?;
            let (after, until) = if kind == TriggerKind::ExpedienteVencido {
                (None, max_age_cutoff)
            } else {
                let warning = Duration::days(i64::from(policy.expediente_warning_days));
                (Some(max_age_cutoff), max_age_cutoff + warning)
            };
            source
                .expedientes_opened_between(LifecycleStage::Gestion, after, until)?
                .into_iter()
                .map(|e| TriggerMatch {
                    kind,
                    entity: EntityRef::new(EntityKind::Expediente, e.id),
                    owner: e.responsible_id,
                    title: if kind == TriggerKind::ExpedienteVencido {
                        format!("Expediente {} vencido", e.code)
                    } else {
                        format!("Expediente {} próximo a vencer", e.code)
                    },
                    message: format!(
                        "El expediente {} \"{}\" sigue en gestión desde {}",
                        e.code,
                        e.title,
                        e.opened_at.format("%Y-%m-%d")
                    ),
                })
                .collect()
        }
        TriggerKind::PrestamoVencido | TriggerKind::PrestamoProximoVencer => {
            let (from, until) = if kind == TriggerKind::PrestamoVencido {
                (None, now)
            } else {
                (Some(now), now + Duration::days(i64::from(policy.loan_warning_days)))
            };
            source
                .active_loans_due_between(from, until)?
                .into_iter()
                .map(|p| TriggerMatch {
                    kind,
                    entity: EntityRef::new(EntityKind::Prestamo, p.id),
                    owner: Some(p.borrower_id),
                    title: if kind == TriggerKind::PrestamoVencido {
                        format!("Préstamo #{} vencido", p.id)
                    } else {
                        format!("Préstamo #{} próximo a vencer", p.id)
                    },
                    message: format!(
                        "La devolución del expediente #{} vence el {}",
                        p.expediente_id,
                        p.due_at.format("%Y-%m-%d %H:%M")
                    ),
                })
                .collect()
        }
        TriggerKind::CertificadoVencido | TriggerKind::CertificadoProximoVencer => {
            let (from, until) = if kind == TriggerKind::CertificadoVencido {
                (None, now)
            } else {
                (
                    Some(now),
                    now + Duration::days(i64::from(policy.certificate_warning_days)),
                )
            };
            source
                .valid_certificates_expiring_between(from, until)?
                .into_iter()
                .map(|c| TriggerMatch {
                    kind,
                    entity: EntityRef::new(EntityKind::Certificado, c.id),
                    owner: c.owner_id,
                    title: if kind == TriggerKind::CertificadoVencido {
                        format!("Certificado {} vencido", c.serial)
                    } else {
                        format!("Certificado {} próximo a vencer", c.serial)
                    },
                    message: format!(
                        "El certificado de {} emitido por {} vence el {}",
                        c.subject,
                        c.issuer,
                        c.valid_to.format("%Y-%m-%d")
                    ),
                })
                .collect()
        }
        TriggerKind::TareaVencida | TriggerKind::TareaProximaVencer => {
            let (from, until) = if kind == TriggerKind::TareaVencida {
                (None, now)
            } else {
                (Some(now), now + Duration::hours(i64::from(policy.task_warning_hours)))
            };
            source
                .tasks_due_between(&WorkflowState::OPEN_TASK, from, until)?
                .into_iter()
                .map(|t| TriggerMatch {
                    kind,
                    entity: EntityRef::new(EntityKind::WorkflowTask, t.id),
                    owner: Some(t.assignee_id),
                    title: if kind == TriggerKind::TareaVencida {
                        format!("Tarea \"{}\" vencida", t.name)
                    } else {
                        format!("Tarea \"{}\" próxima a vencer", t.name)
                    },
                    message: format!(
                        "La tarea del flujo #{} tenía plazo hasta {}",
                        t.instance_id,
                        t.deadline.format("%Y-%m-%d %H:%M")
                    ),
                })
                .collect()
        }
    };

    tracing::debug!("🔎 Trigger '{}' matched {} records", kind, matches.len());
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::{add_user, now, temp_db};
    use sgdea_core::types::{Expediente, Prestamo, LoanStatus, WorkflowTask};

    fn expediente(code: &str, owner: Option<UserId>, opened_at: DateTime<Utc>) -> Expediente {
        Expediente {
            id: 0,
            code: code.into(),
            title: "Historias laborales".into(),
            responsible_id: owner,
            lifecycle_stage: LifecycleStage::Gestion,
            opened_at,
            closed_at: None,
        }
    }

    #[test]
    fn test_expediente_exactly_two_years_old_is_overdue() {
        let db = temp_db();
        let owner = add_user(&db, "ana", "archivist");
        let two_years = now().checked_sub_months(Months::new(24)).unwrap();
        db.insert_expediente(&expediente("EXP-A", Some(owner), two_years)).unwrap();
        db.insert_expediente(&expediente("EXP-B", Some(owner), two_years + Duration::seconds(1)))
            .unwrap();

        let policy = TriggerConfig::default();
        let overdue = scan(&db, TriggerKind::ExpedienteVencido, &policy, now()).unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].owner, Some(owner));
        assert!(overdue[0].title.contains("EXP-A"));

        let approaching = scan(&db, TriggerKind::ExpedienteProximoVencer, &policy, now()).unwrap();
        assert_eq!(approaching.len(), 1);
        assert!(approaching[0].title.contains("EXP-B"));
    }

    #[test]
    fn test_transferred_expediente_does_not_match() {
        let db = temp_db();
        let id = db
            .insert_expediente(&expediente("EXP-C", None, now() - Duration::days(1000)))
            .unwrap();
        db.set_expediente_stage(id, LifecycleStage::Central).unwrap();
        let overdue = scan(&db, TriggerKind::ExpedienteVencido, &TriggerConfig::default(), now()).unwrap();
        assert!(overdue.is_empty());
    }

    #[test]
    fn test_loan_windows() {
        let db = temp_db();
        let borrower = add_user(&db, "beto", "user");
        for due in [now() - Duration::hours(1), now() + Duration::days(2), now() + Duration::days(5)] {
            db.insert_loan(&Prestamo {
                id: 0,
                expediente_id: 1,
                borrower_id: borrower,
                status: LoanStatus::Active,
                loaned_at: now() - Duration::days(10),
                due_at: due,
                returned_at: None,
            })
            .unwrap();
        }
        let policy = TriggerConfig::default();
        let overdue = scan(&db, TriggerKind::PrestamoVencido, &policy, now()).unwrap();
        let soon = scan(&db, TriggerKind::PrestamoProximoVencer, &policy, now()).unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(soon.len(), 1);
        assert_eq!(overdue[0].owner, Some(borrower));
    }

    #[test]
    fn test_task_trigger_ignores_closed_tasks() {
        let db = temp_db();
        let clerk = add_user(&db, "clerk", "user");
        for status in [WorkflowState::Pending, WorkflowState::Approved] {
            db.insert_task(&WorkflowTask {
                id: 0,
                instance_id: 1,
                name: "Revisión".into(),
                status,
                assignee_id: clerk,
                escalation_target_id: None,
                deadline: now() - Duration::hours(2),
                escalation_level: 0,
                escalated_at: None,
            })
            .unwrap();
        }
        let overdue = scan(&db, TriggerKind::TareaVencida, &TriggerConfig::default(), now()).unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].entity.kind, TriggerKind::TareaVencida.entity_kind());
    }

    #[test]
    fn test_trigger_metadata() {
        let config = NotificationConfig::default();
        assert_eq!(TriggerKind::ExpedienteVencido.priority(), Priority::Critical);
        assert_eq!(TriggerKind::ExpedienteVencido.dedupe_window(&config), Duration::days(3));
        assert_eq!(TriggerKind::PrestamoProximoVencer.dedupe_window(&config), Duration::days(7));
        for kind in TriggerKind::ALL {
            assert_eq!(kind.to_string(), kind.notification_type());
        }
    }
}
