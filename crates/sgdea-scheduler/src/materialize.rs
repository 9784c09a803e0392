//! Notification materializer. Turns trigger matches into notification rows.
//!
//! Idempotent per dedupe window: re-running a scan inside the window for
//! the same (type, entity, recipient) creates nothing.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use sgdea_core::config::{NotificationConfig, TriggerConfig};
use sgdea_core::error::{Result, SgdeaError};
use sgdea_core::traits::{NotificationStore, TriggerSource, UserDirectory};
use sgdea_core::types::{NewNotification, UserId};

use crate::report::BatchSummary;
use crate::triggers::{self, TriggerKind, TriggerMatch};

/// Writes automatic notifications for trigger matches.
pub struct Materializer<'a> {
    store: &'a dyn NotificationStore,
    directory: &'a dyn UserDirectory,
    config: &'a NotificationConfig,
}

impl<'a> Materializer<'a> {
    pub fn new(
        store: &'a dyn NotificationStore,
        directory: &'a dyn UserDirectory,
        config: &'a NotificationConfig,
    ) -> Self {
        Self {
            store,
            directory,
            config,
        }
    }

    /// The owner when active, otherwise every active administrator.
    pub fn recipients(&self, owner: Option<UserId>) -> Result<Vec<UserId>> {
        if let Some(id) = owner {
            match self.directory.user(id)? {
                Some(user) if user.active => return Ok(vec![user.id]),
                Some(_) => tracing::debug!("Owner {id} is inactive, falling back to administrators"),
                None => tracing::debug!("Owner {id} not found, falling back to administrators"),
            }
        }
        let admins: Vec<UserId> = self
            .directory
            .users_with_role(&self.config.admin_role)?
            .into_iter()
            .map(|u| u.id)
            .collect();
        if admins.is_empty() {
            return Err(SgdeaError::Precondition(format!(
                "no active users with role '{}'",
                self.config.admin_role
            )));
        }
        Ok(admins)
    }

    /// Create the notifications for one match. Returns how many rows were
    /// created (or, in a dry run, would be). Stops at the first failing recipient.
    pub fn materialize(&self, m: &TriggerMatch, now: DateTime<Utc>, dry_run: bool) -> Result<usize> {
        let window_start = now - m.kind.dedupe_window(self.config);
        let mut created = 0;
        for user_id in self.recipients(m.owner)? {
            if self.create(&notification_for(m, user_id), window_start, now, dry_run)? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Insert one notification unless a twin exists within `window`.
    pub fn notify(
        &self,
        new: &NewNotification,
        window: Duration,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<bool> {
        self.create(new, now - window, now, dry_run)
    }

    fn create(
        &self,
        new: &NewNotification,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<bool> {
        if dry_run {
            return Ok(!self.store.has_recent(new, window_start)?);
        }
        match self.store.insert_unless_recent(new, window_start, now)? {
            Some(id) => {
                tracing::info!(
                    "🔔 Notification #{id} '{}' for user {}",
                    new.notification_type,
                    new.user_id
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Materialize every match, recording one outcome per recipient in
    /// `summary`. A failing match or recipient is counted and the batch
    /// carries on. Returns the number of rows created.
    pub fn materialize_all(
        &self,
        matches: &[TriggerMatch],
        now: DateTime<Utc>,
        summary: &mut BatchSummary,
    ) -> usize {
        let before = summary.succeeded;
        let dry_run = summary.dry_run;
        for m in matches {
            let item = format!("{} {}", m.kind, m.entity);
            let recipients = match self.recipients(m.owner) {
                Ok(recipients) => recipients,
                Err(e) => {
                    summary.record(item, Err::<bool, _>(e));
                    continue;
                }
            };
            let window_start = now - m.kind.dedupe_window(self.config);
            for user_id in recipients {
                let result = self.create(&notification_for(m, user_id), window_start, now, dry_run);
                summary.record(format!("{item} for user {user_id}"), result);
            }
        }
        summary.succeeded - before
    }
}

fn notification_for(m: &TriggerMatch, user_id: UserId) -> NewNotification {
    NewNotification {
        user_id,
        notification_type: m.kind.notification_type().to_string(),
        title: m.title.clone(),
        message: m.message.clone(),
        priority: m.kind.priority(),
        is_automatic: true,
        entity: Some(m.entity),
    }
}

/// Per-trigger counts of a scan run.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerCount {
    pub trigger: TriggerKind,
    pub matched: usize,
    /// Rows created, one per recipient.
    pub created: usize,
}

/// Result of the scan job.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub summary: BatchSummary,
    pub triggers: Vec<TriggerCount>,
}

/// Scan every trigger in `kinds` and materialize the matches.
pub fn run_scan<S>(
    source: &S,
    materializer: &Materializer<'_>,
    kinds: &[TriggerKind],
    policy: &TriggerConfig,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<ScanReport>
where
    S: TriggerSource + ?Sized,
{
    // Ownerless records need somebody to notify.
    if materializer
        .directory
        .users_with_role(&materializer.config.admin_role)?
        .is_empty()
    {
        return Err(SgdeaError::Precondition(format!(
            "no active users with role '{}'",
            materializer.config.admin_role
        )));
    }

    let mut summary = BatchSummary::new("scan", dry_run, now);
    let mut triggers = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let matches = triggers::scan(source, kind, policy, now)?;
        let created = materializer.materialize_all(&matches, now, &mut summary);
        triggers.push(TriggerCount {
            trigger: kind,
            matched: matches.len(),
            created,
        });
    }
    summary.finish(now);
    Ok(ScanReport { summary, triggers })
}
