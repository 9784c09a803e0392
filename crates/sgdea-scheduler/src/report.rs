//! Per-item batch results and JSON run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sgdea_core::error::Result;

/// An item that failed during a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub item: String,
    pub error: String,
}

/// Outcome counts of one batch job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub job: String,
    pub dry_run: bool,
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchSummary {
    pub fn new(job: &str, dry_run: bool, now: DateTime<Utc>) -> Self {
        Self {
            job: job.to_string(),
            dry_run,
            processed: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
            started_at: now,
            finished_at: None,
        }
    }

    /// Fold one item's result in: `Ok(true)` succeeded, `Ok(false)` skipped, `Err` failed.
    pub fn record<E: std::fmt::Display>(
        &mut self,
        item: impl std::fmt::Display,
        result: std::result::Result<bool, E>,
    ) {
        self.processed += 1;
        match result {
            Ok(true) => self.succeeded += 1,
            Ok(false) => self.skipped += 1,
            Err(e) => {
                let item = item.to_string();
                tracing::warn!("⚠️ [{}] {} failed: {}", self.job, item, e);
                self.failed += 1;
                self.errors.push(ItemError {
                    item,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Stamp the end of the run.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        tracing::info!(
            "✅ [{}] processed={} succeeded={} skipped={} failed={}{}",
            self.job,
            self.processed,
            self.succeeded,
            self.skipped,
            self.failed,
            if self.dry_run { " (dry run)" } else { "" }
        );
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}{}", self.job, if self.dry_run { " (dry run)" } else { "" })?;
        writeln!(f, "  {:<10} {:>6}", "processed", self.processed)?;
        writeln!(f, "  {:<10} {:>6}", "succeeded", self.succeeded)?;
        writeln!(f, "  {:<10} {:>6}", "skipped", self.skipped)?;
        write!(f, "  {:<10} {:>6}", "failed", self.failed)?;
        for err in &self.errors {
            write!(f, "\n    - {}: {}", err.item, err.error)?;
        }
        Ok(())
    }
}

/// Write `report` as pretty JSON to `dir/<job>-<timestamp>.json`.
pub fn write_report<T: Serialize>(
    dir: &Path,
    job: &str,
    report: &T,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let file = dir.join(format!("{job}-{}.json", now.format("%Y%m%dT%H%M%S")));
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&file, json)?;
    tracing::debug!("💾 Report written to {}", file.display());
    Ok(file)
}
