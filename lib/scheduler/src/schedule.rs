//! Schedule specifications.
//!
//! A schedule only has to answer one question: when does it fire next
//! after a given instant. Cron expressions are evaluated in UTC.

use crate::error::ScheduleError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;

/// When a scheduled job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// A 5-, 6- or 7-field cron expression.
    Cron { expression: String },
    /// A fixed period.
    Interval { every_ms: u64 },
}

impl ScheduleSpec {
    #[must_use]
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    #[must_use]
    pub fn interval(every: Duration) -> Self {
        Self::Interval {
            every_ms: u64::try_from(every.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Reads a schedule from a trigger configuration.
    ///
    /// Accepts `cron` (or `expression`) for cron schedules and `every_ms`
    /// (or `interval_ms`) for fixed periods.
    ///
    /// # Errors
    ///
    /// Returns an error if neither is present or the schedule is invalid.
    pub fn from_config(config: &JsonValue) -> Result<Self, ScheduleError> {
        let expression = config
            .get("cron")
            .or_else(|| config.get("expression"))
            .and_then(JsonValue::as_str);
        let every_ms = config
            .get("every_ms")
            .or_else(|| config.get("interval_ms"))
            .and_then(JsonValue::as_u64);

        let spec = match (expression, every_ms) {
            (Some(expression), _) => Self::cron(expression),
            (None, Some(every_ms)) => Self::Interval { every_ms },
            (None, None) => return Err(ScheduleError::MissingSchedule),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Checks that the schedule can be evaluated.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed cron expression or a zero interval.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::Cron { expression } => parse_cron(expression).map(|_| ()),
            Self::Interval { every_ms: 0 } => Err(ScheduleError::InvalidInterval),
            Self::Interval { .. } => Ok(()),
        }
    }

    /// Returns the first firing strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule is invalid or never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Self::Cron { expression } => parse_cron(expression)?
                .after(&after)
                .next()
                .ok_or_else(|| ScheduleError::NoUpcomingRun {
                    expression: expression.clone(),
                }),
            Self::Interval { every_ms: 0 } => Err(ScheduleError::InvalidInterval),
            Self::Interval { every_ms } => {
                i64::try_from(*every_ms)
                    .ok()
                    .and_then(TimeDelta::try_milliseconds)
                    .and_then(|every| after.checked_add_signed(every))
                    .ok_or(ScheduleError::InvalidInterval)
            }
        }
    }

    /// Returns how long to wait from `now` until the next firing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule is invalid or never fires again.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, Duration), ScheduleError> {
        let next = self.next_after(now)?;
        let delay = match self {
            Self::Interval { every_ms } => Duration::from_millis(*every_ms),
            Self::Cron { .. } => (next - now).to_std().unwrap_or(Duration::from_millis(100)),
        };
        Ok((next, delay))
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression } => write!(f, "cron '{expression}'"),
            Self::Interval { every_ms } => write!(f, "every {every_ms}ms"),
        }
    }
}

/// Expands 5- and 6-field expressions to the 7-field form the `cron` crate
/// parses (seconds first, year last).
fn normalize_cron_expression(expression: &str) -> String {
    let expression = expression.trim();
    match expression.split_whitespace().count() {
        5 => format!("0 {expression} *"),
        6 => format!("{expression} *"),
        _ => expression.to_string(),
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    normalize_cron_expression(expression)
        .parse::<cron::Schedule>()
        .map_err(|e| ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}
