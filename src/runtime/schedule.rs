/// Schedule evaluation
///
/// A connection's schedule string is either a whole number of minutes
/// (`"15"`) or a cron expression. Five-field cron gets a leading seconds
/// field; `hourly`, `daily` and `every minute` are accepted as shorthands.
/// `is_due` answers one question: should this connection sync now, given
/// when it last ran?

use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Duration, Timelike, Utc};

#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed interval measured from the last run, truncated to the minute
    Interval { minutes: u64 },
    /// Cron expression in UTC, stored in its six-field form
    Cron { expression: String, cron: croner::Cron },
}

/// Normalize a cron expression or shorthand to six fields (seconds first)
pub fn normalize_cron(raw: &str) -> PipelineResult<String> {
    let trimmed = raw.trim();
    match trimmed.to_lowercase().as_str() {
        "every minute" => return Ok("0 * * * * *".to_string()),
        "hourly" | "@hourly" => return Ok("0 0 * * * *".to_string()),
        "daily" | "@daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => Ok(fields.join(" ")),
        n => Err(PipelineError::ScheduleFormat(format!(
            "'{}' has {} fields, expected a minute count or 5/6-field cron",
            raw, n
        ))),
    }
}

impl Schedule {
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::ScheduleFormat("empty schedule".to_string()));
        }
        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            let minutes = trimmed
                .parse::<u64>()
                .map_err(|e| PipelineError::ScheduleFormat(format!("'{}': {}", raw, e)))?;
            return Ok(Self::Interval { minutes });
        }

        let expression = normalize_cron(trimmed)?;
        let cron = expression
            .parse::<croner::Cron>()
            .map_err(|e| PipelineError::ScheduleFormat(format!("'{}': {}", raw, e)))?;
        Ok(Self::Cron { expression, cron })
    }

    /// Whether a sync should start at `now`; never-run connections are always due
    pub fn is_due(&self, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_run_at else {
            return true;
        };

        match self {
            Self::Interval { minutes } => {
                let Ok(minutes) = i64::try_from(*minutes) else {
                    return false;
                };
                let Some(interval) = Duration::try_minutes(minutes) else {
                    return false;
                };
                truncate_to_minute(last)
                    .checked_add_signed(interval)
                    .map(|next| now >= next)
                    .unwrap_or(false)
            }
            // due when a fire time falls strictly between the last run and now
            Self::Cron { cron, .. } => cron
                .iter_after(last)
                .find(|fire| *fire > last)
                .map(|next| next < now)
                .unwrap_or(false),
        }
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(t)
}

/// `is_due` over a raw schedule string; malformed schedules are never due
pub fn is_due(schedule: &str, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match Schedule::parse(schedule) {
        Ok(parsed) => parsed.is_due(last_run_at, now),
        Err(e) => {
            tracing::warn!("⚠️ Ignoring schedule: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn normalizes_cron_forms() {
        assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_cron("30 0 9 * * *").unwrap(), "30 0 9 * * *");
        assert_eq!(normalize_cron("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_cron("Every Minute").unwrap(), "0 * * * * *");
        assert!(normalize_cron("* *").is_err());
    }

    #[test]
    fn never_run_is_due() {
        assert!(is_due("15", None, at(10, 0, 0)));
        assert!(is_due("0 * * * *", None, at(10, 0, 0)));
    }

    #[test]
    fn interval_counts_from_truncated_minute() {
        let last = at(10, 0, 42);
        assert!(!is_due("15", Some(last), at(10, 14, 59)));
        assert!(is_due("15", Some(last), at(10, 15, 0)));
        assert!(is_due("0", Some(last), at(10, 0, 42)));
    }

    #[test]
    fn cron_due_only_after_a_fire_time_passes() {
        // top of every hour
        let schedule = "0 * * * *";
        assert!(!is_due(schedule, Some(at(10, 0, 0)), at(10, 59, 59)));
        assert!(is_due(schedule, Some(at(10, 0, 0)), at(11, 0, 1)));
        assert!(is_due(schedule, Some(at(9, 30, 0)), at(10, 30, 0)));
    }

    #[test]
    fn malformed_schedules_are_never_due() {
        assert!(!is_due("soon", None, at(10, 0, 0)));
        assert!(!is_due("-5", Some(at(9, 0, 0)), at(10, 0, 0)));
        assert!(!is_due("", None, at(10, 0, 0)));
        assert_eq!(Schedule::parse("61 * * * *").unwrap_err().kind(), "ScheduleFormatError");
    }

    #[test]
    fn huge_interval_is_not_due() {
        assert!(!is_due(&u64::MAX.to_string(), Some(at(10, 0, 0)), at(11, 0, 0)));
    }
}
