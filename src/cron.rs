//! Cron expression parsing and next-fire evaluation
//!
//! Supports standard five-field expressions (minute, hour, day-of-month,
//! month, day-of-week) and six-field expressions with a leading seconds
//! field. Fields accept `*`, ranges, steps and comma lists. When both
//! day-of-month and day-of-week are restricted, a fire point matching either
//! is accepted, per standard cron semantics.

use chrono::{DateTime, Datelike, Days, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};

// Search horizon for next_from; expressions with no fire point within this
// window (e.g. "0 0 31 2 *") evaluate to None.
const SEARCH_DAYS: i64 = 366 * 5;

/// A parsed cron schedule expression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpr {
    expr: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    dom: u64,
    months: u64,
    dow: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn bit(mask: u64, idx: u32) -> bool {
    mask & (1 << idx) != 0
}

/// Expand one field spec into a bitmask of allowed values
fn parse_field(spec: &str, min: u32, max: u32) -> Result<u64, String> {
    let mut bits = 0u64;
    for part in spec.split(',') {
        if part.is_empty() {
            return Err("empty list item".to_string());
        }
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be greater than zero".to_string());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let parse_value = |v: &str| -> Result<u32, String> {
            v.parse::<u32>().map_err(|_| format!("invalid value '{}'", v))
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (parse_value(a)?, parse_value(b)?)
        } else {
            let v = parse_value(range_part)?;
            // Vixie cron: "n/step" means "n-max/step"
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo < min || hi > max {
            return Err(format!("value out of range {}..={}", min, max));
        }
        if lo > hi {
            return Err(format!("inverted range {}-{}", lo, hi));
        }

        let mut v = lo;
        while v <= hi {
            bits |= 1 << v;
            v += step;
        }
    }
    Ok(bits)
}

impl CronExpr {
    /// Parse a five- or six-field cron expression
    pub fn parse(expr: &str) -> TaskResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let invalid = |reason: String| TaskError::invalid_expression(expr, reason);

        let (seconds, rest): (u64, &[&str]) = match fields.len() {
            5 => (1, &fields[..]), // fires at second zero
            6 => (
                parse_field(fields[0], 0, 59).map_err(|r| invalid(format!("seconds: {}", r)))?,
                &fields[1..],
            ),
            n => {
                return Err(invalid(format!("expected 5 or 6 fields, got {}", n)));
            }
        };

        let minutes =
            parse_field(rest[0], 0, 59).map_err(|r| invalid(format!("minute: {}", r)))?;
        let hours = parse_field(rest[1], 0, 23).map_err(|r| invalid(format!("hour: {}", r)))?;
        let dom =
            parse_field(rest[2], 1, 31).map_err(|r| invalid(format!("day-of-month: {}", r)))?;
        let months = parse_field(rest[3], 1, 12).map_err(|r| invalid(format!("month: {}", r)))?;
        let mut dow =
            parse_field(rest[4], 0, 7).map_err(|r| invalid(format!("day-of-week: {}", r)))?;
        // 7 is an alias for Sunday
        if bit(dow, 7) {
            dow = (dow | 1) & !(1 << 7);
        }

        Ok(Self {
            expr: expr.to_string(),
            seconds,
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_restricted: rest[2] != "*",
            dow_restricted: rest[4] != "*",
        })
    }

    /// The original expression text
    pub fn expression(&self) -> &str {
        &self.expr
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_match = bit(self.dom, t.day());
        let dow_match = bit(self.dow, t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            // standard cron disjunction when both fields are restricted
            (true, true) => dom_match || dow_match,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (false, false) => true,
        }
    }

    /// Next matching instant at or after `from`, or `None` if no fire point
    /// exists within the search horizon.
    pub fn next_from(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = from.with_nanosecond(0)?;
        if t < from {
            t += Duration::seconds(1);
        }
        let limit = t + Duration::days(SEARCH_DAYS);

        while t < limit {
            if !bit(self.months, t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t) {
                t = t
                    .date_naive()
                    .checked_add_days(Days::new(1))?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = (t + Duration::hours(1)).with_minute(0)?.with_second(0)?;
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t = (t + Duration::minutes(1)).with_second(0)?;
                continue;
            }
            if !bit(self.seconds, t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// Next matching instant strictly after `from`
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_from(from.with_nanosecond(0)? + Duration::seconds(1))
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expr)
    }
}

impl std::str::FromStr for CronExpr {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronExpr {
    type Error = TaskError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronExpr> for String {
    fn from(value: CronExpr) -> Self {
        value.expr
    }
}
