//! Cron evaluation and the per-tick schedule coordinator.
//!
//! Expressions are parsed once into a [`CronSchedule`]; a malformed expression
//! is a configuration error at that point and evaluation itself never fails.
//! Standard five-field expressions (`min hour dom month dow`, Sunday = 0 or 7)
//! are accepted alongside the six/seven-field form with a leading seconds
//! field. When both day of month and day of week are restricted a time must
//! match both, as the `cron` crate evaluates them; vixie cron fires when
//! either matches.

pub mod coordinator;

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use coordinator::{evaluate, scheduled_request, Evaluation, ScheduleCommand, ScheduleCoordinator, TickReport};

const DAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// A validated cron expression.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = normalize(expr)?;
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| EngineError::Config(format!("invalid cron expression {expr:?}: {e}")))?;
        Ok(Self {
            expr: expr.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// First firing time strictly after `after`, or `None` if the expression
    /// never fires again.
    pub fn next_due(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// A schedule that never fired is due immediately.
    pub fn is_due(&self, last_fired: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_fired {
            None => true,
            Some(last) => self.next_due(last).is_some_and(|next| next <= now),
        }
    }
}

impl FromStr for CronSchedule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CronSchedule> for String {
    fn from(schedule: CronSchedule) -> Self {
        schedule.expr
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Eq for CronSchedule {}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expr).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

/// Rewrite a five-field expression into the seconds-first form the `cron`
/// crate parses, translating numeric days of week (0/7 = Sunday) to names.
fn normalize(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = day_of_week_names(fields[4])?;
            Ok(format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(EngineError::Config(format!(
            "invalid cron expression {expr:?}: expected 5, 6 or 7 fields, found {n}"
        ))),
    }
}

/// Numeric ranges and steps are expanded into explicit name lists, so `6-7`
/// becomes `Sat,Sun` and `1-5/2` becomes `Mon,Wed,Fri`. Names pass through.
fn day_of_week_names(field: &str) -> Result<String> {
    let mut days: Vec<String> = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step)?)),
            None => (part, None),
        };
        let bounds = match (range, range.split_once('-')) {
            ("*", _) => step.map(|_| (0, 6)),
            (_, Some((start, end))) => match (day_number(start)?, day_number(end)?) {
                (Some(start), Some(end)) => Some((start, end)),
                _ => {
                    days.push(with_step(format!("{}-{}", day_name(start)?, day_name(end)?), step));
                    continue;
                }
            },
            (single, None) => day_number(single)?.map(|n| (n, if step.is_some() { 7 } else { n })),
        };
        let Some((start, end)) = bounds else {
            days.push(with_step(range.to_string(), step));
            continue;
        };
        if start > end {
            return Err(EngineError::Config(format!("day of week range {range} runs backwards")));
        }
        for n in (start..=end).step_by(step.unwrap_or(1)) {
            let name = DAY_NAMES[n].to_string();
            if !days.contains(&name) {
                days.push(name);
            }
        }
    }
    Ok(days.join(","))
}

fn parse_step(step: &str) -> Result<usize> {
    match step.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(EngineError::Config(format!("invalid day of week step {step:?}"))),
    }
}

fn with_step(range: String, step: Option<usize>) -> String {
    match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
    }
}

/// `None` for names, which the `cron` crate reads itself.
fn day_number(token: &str) -> Result<Option<usize>> {
    match token.parse::<usize>() {
        Ok(n) if n < DAY_NAMES.len() => Ok(Some(n)),
        Ok(n) => Err(EngineError::Config(format!("day of week {n} is out of range 0-7"))),
        Err(_) => Ok(None),
    }
}

fn day_name(token: &str) -> Result<String> {
    Ok(day_number(token)?.map_or_else(|| token.to_string(), |n| DAY_NAMES[n].to_string()))
}
