//! Pipeline facade: one database, one config, one set of delivery channels.

use chrono::{DateTime, Utc};
use serde::Serialize;

use sgdea_core::config::{expand_path, RetentionConfig, SgdeaConfig};
use sgdea_core::error::Result;

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::engine::JobKind;
use crate::escalation::{self, EscalationReport};
use crate::housekeeping::{self, CleanupOptions, CleanupReport};
use crate::materialize::{self, Materializer, ScanReport};
use crate::persistence::SgdeaDb;
use crate::triggers::TriggerKind;

/// Report of any one job.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobReport {
    Scan(ScanReport),
    Dispatch(DispatchReport),
    Escalate(EscalationReport),
    Cleanup(CleanupReport),
}

impl JobReport {
    pub fn kind(&self) -> JobKind {
        match self {
            JobReport::Scan(_) => JobKind::Scan,
            JobReport::Dispatch(_) => JobKind::Dispatch,
            JobReport::Escalate(_) => JobKind::Escalate,
            JobReport::Cleanup(_) => JobKind::Cleanup,
        }
    }

    /// Whether any item in the run failed.
    pub fn has_failures(&self) -> bool {
        match self {
            JobReport::Scan(r) => r.summary.has_failures(),
            JobReport::Dispatch(r) => r.email.has_failures() || r.sms.has_failures(),
            JobReport::Escalate(r) => r.summary.has_failures(),
            JobReport::Cleanup(_) => false,
        }
    }
}

impl std::fmt::Display for JobReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobReport::Scan(r) => {
                writeln!(f, "{}", r.summary)?;
                for t in r.triggers.iter().filter(|t| t.matched > 0) {
                    write!(f, "\n  {:<28} matched {:>4}  created {:>4}", t.trigger, t.matched, t.created)?;
                }
                Ok(())
            }
            JobReport::Dispatch(r) => {
                writeln!(f, "{} candidate(s)", r.candidates)?;
                writeln!(f, "{}", r.email)?;
                write!(f, "{}", r.sms)
            }
            JobReport::Escalate(r) => write!(f, "{}", r.summary),
            JobReport::Cleanup(r) => write!(f, "{r}"),
        }
    }
}

/// Owns everything the jobs need.
pub struct Pipeline {
    db: SgdeaDb,
    config: SgdeaConfig,
    dispatcher: Dispatcher,
}

impl Pipeline {
    pub fn new(db: SgdeaDb, config: SgdeaConfig, dispatcher: Dispatcher) -> Self {
        Self {
            db,
            config,
            dispatcher,
        }
    }

    /// Open the configured database (creating it if needed).
    pub fn open(config: SgdeaConfig, dispatcher: Dispatcher) -> Result<Self> {
        let path = expand_path(&config.database.path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = SgdeaDb::open(&path)?;
        Ok(Self::new(db, config, dispatcher))
    }

    pub fn db(&self) -> &SgdeaDb {
        &self.db
    }

    pub fn config(&self) -> &SgdeaConfig {
        &self.config
    }

    fn materializer(&self) -> Materializer<'_> {
        Materializer::new(&self.db, &self.db, &self.config.notifications)
    }

    pub fn run_scan(&self, now: DateTime<Utc>, dry_run: bool) -> Result<ScanReport> {
        materialize::run_scan(
            &self.db,
            &self.materializer(),
            &TriggerKind::ALL,
            &self.config.triggers,
            now,
            dry_run,
        )
    }

    /// Dispatch with `window_minutes`, or the configured window.
    pub async fn run_dispatch(
        &self,
        window_minutes: Option<u32>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<DispatchReport> {
        let window = window_minutes.unwrap_or(self.config.notifications.dispatch_window_minutes);
        self.dispatcher
            .dispatch(&self.db, &self.db, window, now, dry_run)
            .await
    }

    pub fn run_escalation(&self, now: DateTime<Utc>, dry_run: bool) -> Result<EscalationReport> {
        escalation::escalate_overdue(
            &self.db,
            &self.db,
            &self.materializer(),
            &self.config.escalation,
            now,
            dry_run,
        )
    }

    /// Cleanup with `policy`, typically the configured retention plus overrides.
    pub fn run_cleanup(
        &self,
        policy: &RetentionConfig,
        options: CleanupOptions,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport> {
        housekeeping::cleanup(&self.db, &self.db, policy, options, now)
    }

    /// Run one job unattended, as the scheduler does. Workflow archival
    /// needs confirmation, so scheduled cleanups skip it.
    pub async fn run_job(&self, kind: JobKind, now: DateTime<Utc>) -> Result<JobReport> {
        Ok(match kind {
            JobKind::Scan => JobReport::Scan(self.run_scan(now, false)?),
            JobKind::Dispatch => JobReport::Dispatch(self.run_dispatch(None, now, false).await?),
            JobKind::Escalate => JobReport::Escalate(self.run_escalation(now, false)?),
            JobKind::Cleanup => JobReport::Cleanup(self.run_cleanup(
                &self.config.retention,
                CleanupOptions::default(),
                now,
            )?),
        })
    }

    /// scan, then dispatch, then escalate. Stops at the first job error.
    pub async fn run_all(&self, now: DateTime<Utc>) -> Result<Vec<JobReport>> {
        let mut reports = Vec::with_capacity(3);
        for kind in [JobKind::Scan, JobKind::Dispatch, JobKind::Escalate] {
            reports.push(self.run_job(kind, now).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::{add_user, now};
    use chrono::{Duration, Months};
    use sgdea_core::traits::NotificationStore;
    use sgdea_core::types::{Expediente, LifecycleStage};

    fn pipeline() -> Pipeline {
        Pipeline::new(
            SgdeaDb::open_in_memory().unwrap(),
            SgdeaConfig::default(),
            Dispatcher::default(),
        )
    }

    #[tokio::test]
    async fn test_run_all_end_to_end() {
        let p = pipeline();
        add_user(p.db(), "admin", "admin");
        let owner = add_user(p.db(), "ana", "archivist");
        p.db()
            .insert_expediente(&Expediente {
                id: 0,
                code: "EXP-2024-001".into(),
                title: "Contratos".into(),
                responsible_id: Some(owner),
                lifecycle_stage: LifecycleStage::Gestion,
                opened_at: now().checked_sub_months(Months::new(25)).unwrap(),
                closed_at: None,
            })
            .unwrap();

        let reports = p.run_all(now()).await.unwrap();
        let kinds: Vec<JobKind> = reports.iter().map(JobReport::kind).collect();
        assert_eq!(kinds, vec![JobKind::Scan, JobKind::Dispatch, JobKind::Escalate]);
        assert!(reports.iter().all(|r| !r.has_failures()));

        match &reports[0] {
            JobReport::Scan(scan) => assert_eq!(scan.summary.succeeded, 1),
            other => panic!("unexpected report {other:?}"),
        }
        // Channels are disabled, so nothing was attempted.
        match &reports[1] {
            JobReport::Dispatch(d) => {
                assert_eq!(d.candidates, 1);
                assert_eq!(d.email.processed, 0);
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert_eq!(p.db().list_for_user(owner, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_cleanup_skips_workflows() {
        let p = pipeline();
        let report = p.run_job(JobKind::Cleanup, now() + Duration::days(1)).await.unwrap();
        match report {
            JobReport::Cleanup(r) => assert_eq!(r.workflows_archived, None),
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = std::env::temp_dir().join("sgdea-pipeline-test");
        std::fs::remove_dir_all(&dir).ok();
        let mut config = SgdeaConfig::default();
        config.database.path = dir.join("nested").join("sgdea.db").display().to_string();
        let p = Pipeline::open(config, Dispatcher::default()).unwrap();
        assert!(p.db().list_users().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
