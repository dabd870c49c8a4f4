//! Schedule Expressions
//!
//! Pure evaluation of a subscription's schedule: `(expression, reference) ->
//! next time strictly after reference`. Supported forms:
//! - `@every 30m`, or a bare duration such as `2h` / `1h 30m`
//! - `@hourly`, `@daily` / `@midnight`, `@weekly`, `@monthly`
//! - five-field cron: `minute hour day-of-month month day-of-week`, with
//!   `*`, lists (`1,15`), ranges (`9-17`) and steps (`*/15`, `0-30/10`)
//!
//! Cron expressions are evaluated in UTC.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{IngestionError, Result};

/// Shortest accepted interval
const MIN_INTERVAL_SECS: i64 = 1;

/// How far ahead a cron search may look before the expression is declared
/// unsatisfiable (e.g. `0 0 31 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    Cron(CronExpression),
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(IngestionError::invalid_schedule(expression, "empty expression"));
        }

        let lowered = expr.to_lowercase();
        let macro_expansion = match lowered.as_str() {
            "@hourly" => Some("0 * * * *"),
            "@daily" | "@midnight" => Some("0 0 * * *"),
            "@weekly" => Some("0 0 * * 0"),
            "@monthly" => Some("0 0 1 * *"),
            _ => None,
        };
        if let Some(cron) = macro_expansion {
            return CronExpression::parse(cron).map(Schedule::Cron);
        }

        if let Some(rest) = lowered.strip_prefix("@every") {
            return parse_interval(expression, rest.trim()).map(Schedule::Every);
        }

        if lowered.split_whitespace().count() == 5 {
            return CronExpression::parse(expr)
                .map(Schedule::Cron)
                .map_err(|e| match e {
                    IngestionError::InvalidSchedule { reason, .. } => {
                        IngestionError::invalid_schedule(expression, reason)
                    }
                    other => other,
                });
        }

        parse_interval(expression, &lowered).map(Schedule::Every)
    }

    /// Earliest instant strictly after `reference` satisfying the schedule.
    /// `None` means the expression can never fire.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => reference.checked_add_signed(*interval),
            Schedule::Cron(cron) => cron.next_after(reference),
        }
    }
}

impl FromStr for Schedule {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self> {
        Schedule::parse(s)
    }
}

/// Parses `expression` and evaluates it in one step; an expression that
/// parses but never fires is reported as invalid.
pub fn next_due(expression: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Schedule::parse(expression)?
        .next_after(reference)
        .ok_or_else(|| IngestionError::invalid_schedule(expression, "never fires"))
}

fn parse_interval(original: &str, text: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(text)
        .map_err(|e| IngestionError::invalid_schedule(original, e.to_string()))?;
    let interval = Duration::from_std(std_duration)
        .map_err(|e| IngestionError::invalid_schedule(original, e.to_string()))?;

    if interval < Duration::seconds(MIN_INTERVAL_SECS) {
        return Err(IngestionError::invalid_schedule(
            original,
            "interval must be at least one second",
        ));
    }
    Ok(interval)
}

// ============================================
// CRON
// ============================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    /// Day field does not start with `*`. Only when both day fields are
    /// restricted does a day match on either of them, as in Vixie cron.
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(IngestionError::invalid_schedule(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let field = |index: usize, name: &str, min: u32, max: u32| {
            parse_field(fields[index], min, max).map_err(|reason| {
                IngestionError::invalid_schedule(expression, format!("{name}: {reason}"))
            })
        };

        let minutes = field(0, "minute", 0, 59)?;
        let hours = field(1, "hour", 0, 23)?;
        let days_of_month = field(2, "day-of-month", 1, 31)?;
        let months = field(3, "month", 1, 12)?;
        let mut days_of_week = field(4, "day-of-week", 0, 7)?;

        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expression.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, t.day());
        let dow = bit(self.days_of_week, t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Walks forward field by field (month, day, hour, minute), jumping to the
    /// start of the next unit whenever a field does not match.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let truncated = reference
            .with_second(0)?
            .with_nanosecond(0)?;
        let mut t = truncated + Duration::minutes(1);
        let limit = reference + Duration::days(SEARCH_HORIZON_DAYS);

        while t <= limit {
            if !bit(self.months, t.month()) {
                t = start_of_next_month(&t)?;
                continue;
            }
            if !self.day_matches(&t) {
                t = start_of_day(&t)? + Duration::days(1);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = start_of_hour(&t)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn start_of_hour(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0).single()
}

fn start_of_day(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0).single()
}

fn start_of_next_month(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Parses one cron field into a bitmask of allowed values.
fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<u64, String> {
    let mut mask = 0u64;

    for part in field.split(',') {
        if part.is_empty() {
            return Err("empty list element".to_string());
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, min, max)?, parse_value(hi, min, max)?)
        } else {
            let value = parse_value(range, min, max)?;
            // `5/10` means "from 5 to the end, every 10"
            if step > 1 { (value, max) } else { (value, value) }
        };

        if start > end {
            return Err(format!("range {start}-{end} is reversed"));
        }

        let mut value = start;
        while value <= end {
            mask |= 1u64 << value;
            value += step;
        }
    }

    Ok(mask)
}

fn parse_value(text: &str, min: u32, max: u32) -> std::result::Result<u32, String> {
    let value: u32 = text
        .parse()
        .map_err(|_| format!("invalid value '{text}'"))?;
    if value < min || value > max {
        return Err(format!("value {value} outside {min}-{max}"));
    }
    Ok(value)
}
