//! Trigger expression parsing and next-fire computation.
//!
//! Expressions have 5 fields (`min hour dom month dow`) or 6 with a leading
//! seconds field. Day-of-week accepts `0-6` (Sunday = 0, `7` is also Sunday)
//! or three-letter names. The `cron` crate wants a seconds field and counts
//! weekdays from 1, so expressions are normalized before parsing.

use super::{SchedulerError, SchedulerResult};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Field-count check only. An empty expression is valid and means
/// "manual only".
pub fn validate(expr: &str) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return true;
    }
    matches!(expr.split_whitespace().count(), 5 | 6)
}

/// First instant strictly after `after` matching `expr`.
pub fn next_fire_time(expr: &str, after: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
    let trigger = TriggerExpression::parse(expr)?;
    trigger.next_after(after).ok_or_else(|| SchedulerError::InvalidExpression {
        expression: expr.to_string(),
        reason: "expression never fires".to_string(),
    })
}

/// A parsed, non-empty trigger expression.
#[derive(Debug, Clone)]
pub struct TriggerExpression {
    schedule: CronSchedule,
    expression: String,
}

impl TriggerExpression {
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let invalid = |reason: String| SchedulerError::InvalidExpression {
            expression: expr.to_string(),
            reason,
        };

        let normalized = normalize(expr).map_err(invalid)?;
        let schedule = CronSchedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            schedule,
            expression: expr.trim().to_string(),
        })
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Fire instants in `(after, until]`, at most `limit` of them.
    pub fn fires_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .take_while(|t| *t <= until)
            .take(limit)
            .collect()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl std::fmt::Display for TriggerExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Rewrite into the 6-field, named-weekday form the `cron` crate parses.
fn normalize(expr: &str) -> Result<String, String> {
    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        0 => return Err("empty expression".to_string()),
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => return Err(format!("expected 5 or 6 fields, got {}", n)),
    }

    let dow = weekday_field(&fields[5])?;
    fields[5] = dow;
    Ok(fields.join(" "))
}

fn weekday_field(field: &str) -> Result<String, String> {
    let mut out: Vec<String> = Vec::new();
    for item in field.split(',') {
        out.push(weekday_item(item)?);
    }
    Ok(out.join(","))
}

fn weekday_item(item: &str) -> Result<String, String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid day-of-week step '{}'", item))?;
            if step == 0 {
                return Err(format!("invalid day-of-week step '{}'", item));
            }
            (base, Some(step))
        }
        None => (item, None),
    };

    let is_numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    let (start, end) = match base.split_once('-') {
        Some((a, b)) if is_numeric(a) && is_numeric(b) => (day_number(a)?, day_number(b)?),
        Some(_) => return Ok(item.to_string()),
        None if base == "*" || base == "?" => match step {
            Some(_) => (0, 6),
            None => return Ok(item.to_string()),
        },
        None if is_numeric(base) => {
            let day = day_number(base)?;
            match step {
                Some(_) => (day, 6),
                None => (day, day),
            }
        }
        None => return Ok(item.to_string()),
    };

    if start > end {
        return Err(format!("invalid day-of-week range '{}'", item));
    }

    let mut names: Vec<&str> = Vec::new();
    let mut day = start;
    while day <= end {
        let name = WEEKDAYS[(day % 7) as usize];
        if !names.contains(&name) {
            names.push(name);
        }
        day += step.unwrap_or(1);
    }
    Ok(names.join(","))
}

fn day_number(s: &str) -> Result<u32, String> {
    let n: u32 = s
        .parse()
        .map_err(|_| format!("invalid day-of-week '{}'", s))?;
    if n > 7 {
        return Err(format!("day-of-week {} out of range 0-7", n));
    }
    Ok(n)
}
