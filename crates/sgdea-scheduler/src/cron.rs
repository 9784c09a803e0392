//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds, UTC)
//! Fields: *, */N, N, A-B, A-B/N and comma lists of those.
//! Example: "30 2 * * 0" = Sundays at 02:30

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use sgdea_core::error::{Result, SgdeaError};

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    /// 0 = Sunday. A 7 in the expression is folded into 0.
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(SgdeaError::Config(format!(
                "Invalid cron expression: '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }
        let field = |idx: usize, min: u32, max: u32| {
            parse_field(parts[idx], min, max).ok_or_else(|| {
                SgdeaError::Config(format!(
                    "Invalid cron field '{}' in '{expression}' (allowed {min}-{max})",
                    parts[idx]
                ))
            })
        };

        let mut days_of_week: Vec<u32> = field(4, 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect();
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            expression: expression.to_string(),
            minutes: field(0, 0, 59)?,
            hours: field(1, 0, 23)?,
            days_of_month: field(2, 1, 31)?,
            months: field(3, 1, 12)?,
            days_of_week,
            // Any field starting with '*' (including "*/N") leaves its day unrestricted.
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, dt: &DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(&dt.day());
        let dow = self
            .days_of_week
            .contains(&dt.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted either may match.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    /// Whether `dt` falls on a minute this schedule fires.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.months.contains(&dt.month())
            && self.day_matches(dt)
            && self.hours.contains(&dt.hour())
            && self.minutes.contains(&dt.minute())
    }

    /// First firing minute strictly after `after`, searching up to five years ahead.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after + Duration::minutes(1);
        let mut candidate = Utc
            .with_ymd_and_hms(
                start.year(),
                start.month(),
                start.day(),
                start.hour(),
                start.minute(),
                0,
            )
            .single()?;
        let limit = after + Duration::days(366 * 5);

        while candidate <= limit {
            if !self.months.contains(&candidate.month()) || !self.day_matches(&candidate) {
                // Jump to the next midnight.
                let date = candidate.date_naive().succ_opt()?;
                candidate = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if self.minutes.contains(&candidate.minute()) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let part = part.trim();
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().ok()?),
            None => (part, 1),
        };
        if step == 0 {
            return None;
        }
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (a.parse().ok()?, b.parse().ok()?)
        } else {
            let n: u32 = range.parse().ok()?;
            // "N/S" means from N to the end.
            if part.contains('/') { (n, max) } else { (n, n) }
        };
        if lo < min || hi > max || lo > hi {
            return None;
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}
