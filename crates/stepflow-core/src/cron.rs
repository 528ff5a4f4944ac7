// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cron expression parsing and next-occurrence computation.
//!
//! Expressions have 5 fields (`minute hour dayOfMonth month dayOfWeek`)
//! or 6 with a leading seconds field. Fields support `*`, comma lists,
//! `a-b` ranges and `/n` steps. Next-occurrence search walks forward
//! minute by minute (up to one year) in the schedule's timezone; when both
//! day-of-month and day-of-week are restricted, either matching suffices
//! (Vixie behavior), otherwise both must match.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;

/// One parsed cron field: the set of values it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    values: BTreeSet<u32>,
    is_wildcard: bool,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

fn parse_field(spec: &str, min: u32, max: u32, expression: &str) -> Result<Field> {
    let invalid = |reason: String| EngineError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    let mut values = BTreeSet::new();
    let mut is_wildcard = true;
    for part in spec.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("invalid step '{step}'")))?;
                if step == 0 {
                    return Err(invalid("step must be positive".to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else {
            is_wildcard = false;
            match range.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo
                        .parse()
                        .map_err(|_| invalid(format!("invalid value '{lo}'")))?;
                    let hi: u32 = hi
                        .parse()
                        .map_err(|_| invalid(format!("invalid value '{hi}'")))?;
                    (lo, hi)
                }
                None => {
                    let v: u32 = range
                        .parse()
                        .map_err(|_| invalid(format!("invalid value '{range}'")))?;
                    (v, v)
                }
            }
        };
        if lo > hi {
            return Err(invalid(format!("range {lo}-{hi} is inverted")));
        }
        if lo < min || hi > max {
            return Err(invalid(format!(
                "value out of range: {lo}-{hi} not within {min}-{max}"
            )));
        }
        let mut v = lo;
        while v <= hi {
            values.insert(v);
            v += step;
        }
        // A stepped wildcard restricts the field.
        if step != 1 {
            is_wildcard = false;
        }
    }
    if values.is_empty() {
        return Err(invalid("field matches no values".to_string()));
    }
    Ok(Field { values, is_wildcard })
}

/// A validated cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    seconds: Option<Field>,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpression {
    /// Parses a 5- or 6-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (seconds, rest): (Option<Field>, &[&str]) = match fields.len() {
            5 => (None, &fields[..]),
            6 => (
                Some(parse_field(fields[0], 0, 59, expression)?),
                &fields[1..],
            ),
            n => {
                return Err(EngineError::InvalidCron {
                    expression: expression.to_string(),
                    reason: format!("expected 5 or 6 fields, found {n}"),
                })
            }
        };
        // 7 is accepted as an alias for Sunday via normalize_dow.
        let day_of_week = parse_field(&normalize_dow(rest[4]), 0, 6, expression)?;
        Ok(Self {
            source: expression.to_string(),
            seconds,
            minute: parse_field(rest[0], 0, 59, expression)?,
            hour: parse_field(rest[1], 0, 23, expression)?,
            day_of_month: parse_field(rest[2], 1, 31, expression)?,
            month: parse_field(rest[3], 1, 12, expression)?,
            day_of_week,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches<T: TimeZone>(&self, t: &DateTime<T>) -> bool {
        let dom = self.day_of_month.matches(t.day());
        let dow = self.day_of_week.matches(t.weekday().num_days_from_sunday());
        if !self.day_of_month.is_wildcard && !self.day_of_week.is_wildcard {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether the expression matches a wall-clock instant (second
    /// precision when a seconds field is present, else minute precision).
    pub fn matches<T: TimeZone>(&self, t: &DateTime<T>) -> bool {
        if let Some(seconds) = &self.seconds {
            if !seconds.matches(t.second()) {
                return false;
            }
        }
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.month.matches(t.month())
            && self.day_matches(t)
    }

    /// First matching instant strictly after `after`, evaluated in `tz`,
    /// searching up to one year ahead.
    pub fn next_occurrence(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);

        // Within the current minute a seconds field may still match.
        if let Some(seconds) = &self.seconds {
            let minute_start = truncate_to_minute(&local);
            if self.minute.matches(local.minute())
                && self.hour.matches(local.hour())
                && self.month.matches(local.month())
                && self.day_matches(&local)
            {
                if let Some(&s) = seconds.values.iter().find(|&&s| s > local.second()) {
                    let candidate = minute_start + ChronoDuration::seconds(s as i64);
                    return Some(candidate.with_timezone(&Utc));
                }
            }
        }

        let mut cursor = truncate_to_minute(&local) + ChronoDuration::minutes(1);
        let limit = cursor + ChronoDuration::days(366);
        while cursor < limit {
            if self.minute.matches(cursor.minute())
                && self.hour.matches(cursor.hour())
                && self.month.matches(cursor.month())
                && self.day_matches(&cursor)
            {
                let candidate = match &self.seconds {
                    Some(seconds) => {
                        let first = *seconds.values.iter().next()?;
                        cursor + ChronoDuration::seconds(first as i64)
                    }
                    None => cursor,
                };
                return Some(candidate.with_timezone(&Utc));
            }
            cursor += ChronoDuration::minutes(1);
        }
        None
    }
}

fn normalize_dow(spec: &str) -> String {
    // Plain "7" means Sunday; inside ranges 7 is rejected to keep the
    // arithmetic simple, matching common cron implementations.
    spec.split(',')
        .map(|part| if part == "7" { "0" } else { part })
        .collect::<Vec<_>>()
        .join(",")
}

fn truncate_to_minute<T: TimeZone>(t: &DateTime<T>) -> DateTime<T> {
    t.clone() - ChronoDuration::seconds(t.second() as i64)
        - ChronoDuration::nanoseconds(t.nanosecond() as i64)
}
