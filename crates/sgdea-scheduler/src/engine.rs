//! Job scheduler: decides which pipeline jobs are due on each tick.
//! The caller drives it from a tokio interval (sleeps between checks).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sgdea_core::config::ScheduleConfig;
use sgdea_core::error::Result;

use crate::cron::CronSchedule;

/// A pipeline job the scheduler can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scan,
    Dispatch,
    Escalate,
    Cleanup,
}

impl JobKind {
    /// Order jobs run in when several are due on the same tick.
    pub const ALL: [JobKind; 4] = [
        JobKind::Scan,
        JobKind::Dispatch,
        JobKind::Escalate,
        JobKind::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scan => "scan",
            JobKind::Dispatch => "dispatch",
            JobKind::Escalate => "escalate",
            JobKind::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cron-driven job.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub kind: JobKind,
    pub schedule: CronSchedule,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

impl ScheduledJob {
    pub fn new(kind: JobKind, schedule: CronSchedule, now: DateTime<Utc>) -> Self {
        let next_run = schedule.next_after(now);
        Self {
            kind,
            schedule,
            next_run,
            last_run: None,
            run_count: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_some_and(|next| next <= now)
    }
}

/// The set of scheduled jobs.
#[derive(Debug, Clone, Default)]
pub struct JobScheduler {
    jobs: Vec<ScheduledJob>,
}

impl JobScheduler {
    /// Build from config. An empty expression disables that job.
    pub fn from_config(config: &ScheduleConfig, now: DateTime<Utc>) -> Result<Self> {
        let mut jobs = Vec::new();
        for kind in JobKind::ALL {
            let expression = match kind {
                JobKind::Scan => &config.scan,
                JobKind::Dispatch => &config.dispatch,
                JobKind::Escalate => &config.escalate,
                JobKind::Cleanup => &config.cleanup,
            };
            if expression.trim().is_empty() {
                tracing::info!("📅 Job '{kind}' disabled");
                continue;
            }
            let job = ScheduledJob::new(kind, CronSchedule::parse(expression)?, now);
            tracing::info!(
                "📅 Job '{}' scheduled: {} (next {})",
                kind,
                job.schedule,
                job.next_run
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into())
            );
            jobs.push(job);
        }
        Ok(Self { jobs })
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// Earliest upcoming run across all jobs.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.jobs.iter().filter_map(|j| j.next_run).min()
    }

    /// Tick. Returns the jobs due at `now` and advances their next run.
    /// A job that missed several runs fires once.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<JobKind> {
        let mut fired = Vec::new();
        for job in self.jobs.iter_mut() {
            if !job.is_due(now) {
                continue;
            }
            tracing::info!("🔔 Job triggered: '{}'", job.kind);
            job.last_run = Some(now);
            job.run_count += 1;
            job.next_run = job.schedule.next_after(now);
            fired.push(job.kind);
        }
        fired
    }
}
