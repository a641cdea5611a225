//! Five-field cron expressions.
//!
//! Standard semantics: minute, hour, day-of-month, month, day-of-week,
//! with `*`, lists, ranges, and `/step`. Day-of-month and day-of-week
//! combine with OR when both are restricted, per convention. Evaluation is
//! in UTC at minute resolution.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// Upper bound for the next-occurrence search: 366 days of minutes.
const MAX_SEARCH_MINUTES: i64 = 366 * 24 * 60;

/// A cron expression failed to parse.
#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct CronParseError {
    pub expression: String,
    pub reason: String,
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a five-field expression.
    ///
    /// # Errors
    ///
    /// Returns [`CronParseError`] on a wrong field count, a value outside
    /// its field's range, or a malformed list/range/step.
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        let err = |reason: String| CronParseError {
            expression: expression.to_string(),
            reason,
        };

        let (minutes, _) = parse_field(fields[0], 0, 59).map_err(&err)?;
        let (hours, _) = parse_field(fields[1], 0, 23).map_err(&err)?;
        let (days_of_month, dom_restricted) = parse_field(fields[2], 1, 31).map_err(&err)?;
        let (months, _) = parse_field(fields[3], 1, 12).map_err(&err)?;
        let (dow_raw, dow_restricted) = parse_field(fields[4], 0, 7).map_err(&err)?;
        // 7 is an alias for Sunday.
        let days_of_week = (dow_raw | (dow_raw >> 7)) & 0x7f;

        Ok(Self {
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            dom_restricted,
            dow_restricted,
        })
    }

    /// Whether `at` (truncated to the minute) matches this schedule.
    #[must_use]
    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        let minute_ok = bit(self.minutes, at.minute());
        let hour_ok = bit(u64::from(self.hours), at.hour());
        let month_ok = bit(u64::from(self.months), at.month());
        let dom_ok = bit(u64::from(self.days_of_month), at.day());
        let dow_ok = bit(
            u64::from(self.days_of_week),
            at.weekday().num_days_from_sunday(),
        );
        let day_ok = match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        };
        minute_ok && hour_ok && month_ok && day_ok
    }

    /// The first matching minute strictly after `after`, within a year.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let truncated = after
            .with_second(0)
            .and_then(|dt| dt.with_nanosecond(0))?;
        let mut candidate = truncated + Duration::minutes(1);
        for _ in 0..MAX_SEARCH_MINUTES {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn bit(mask: u64, index: u32) -> bool {
    mask & (1 << index) != 0
}

/// Parse one field into a bitmask plus whether it was restricted (not `*`).
fn parse_field(text: &str, min: u32, max: u32) -> Result<(u64, bool), String> {
    if text == "*" {
        return Ok((range_mask(min, max, 1), false));
    }

    let mut mask = 0u64;
    for part in text.split(',') {
        let (range_part, step) = match part.split_once('/') {
            None => (part, 1),
            Some((range_part, step_text)) => {
                let step: u32 = step_text
                    .parse()
                    .map_err(|_| format!("invalid step '{step_text}'"))?;
                if step == 0 {
                    return Err(format!("step must be positive in '{part}'"));
                }
                (range_part, step)
            }
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((lo_text, hi_text)) = range_part.split_once('-') {
            let lo = parse_number(lo_text, min, max)?;
            let hi = parse_number(hi_text, min, max)?;
            if lo > hi {
                return Err(format!("range '{range_part}' is inverted"));
            }
            (lo, hi)
        } else {
            let value = parse_number(range_part, min, max)?;
            // A bare value with a step ("3/5") runs to the field maximum.
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };
        mask |= range_mask(lo, hi, step);
    }
    Ok((mask, true))
}

fn parse_number(text: &str, min: u32, max: u32) -> Result<u32, String> {
    let value: u32 = text
        .parse()
        .map_err(|_| format!("invalid value '{text}'"))?;
    if value < min || value > max {
        return Err(format!("value {value} outside range {min}-{max}"));
    }
    Ok(value)
}

fn range_mask(lo: u32, hi: u32, step: u32) -> u64 {
    let mut mask = 0u64;
    let mut value = lo;
    while value <= hi {
        mask |= 1 << value;
        value += step;
    }
    mask
}
