//! Error types for the scheduler crate.
//!
//! - `TriggerError`: trigger registration and lookup
//! - `ScheduleError`: parsing and evaluating a schedule
//! - `SchedulerError`: managing scheduled jobs

use copper_relay_core::{JobId, TriggerId, WorkflowId};
use std::fmt;

/// Errors from trigger operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// Trigger not found.
    NotFound { trigger_id: TriggerId },
    /// The trigger's workflow is not registered.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// Another trigger already listens on this webhook path.
    PathInUse { path: String, trigger_id: TriggerId },
    /// Invalid trigger configuration.
    InvalidConfig { reason: String },
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { trigger_id } => write!(f, "trigger not found: {trigger_id}"),
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "trigger workflow not found: {workflow_id}")
            }
            Self::PathInUse { path, trigger_id } => {
                write!(f, "webhook path {path} is already bound to {trigger_id}")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid trigger config: {reason}")
            }
        }
    }
}

impl std::error::Error for TriggerError {}

/// Errors from schedule operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    InvalidCronExpression { expression: String, reason: String },
    /// Interval schedules need a positive period.
    InvalidInterval,
    /// The configuration names neither a cron expression nor an interval.
    MissingSchedule,
    /// The expression never fires again.
    NoUpcomingRun { expression: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCronExpression { expression, reason } => {
                write!(f, "invalid cron expression '{expression}': {reason}")
            }
            Self::InvalidInterval => write!(f, "interval must be greater than zero"),
            Self::MissingSchedule => {
                write!(f, "schedule needs a cron expression or an interval")
            }
            Self::NoUpcomingRun { expression } => {
                write!(f, "cron expression '{expression}' has no upcoming run")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Errors from managing scheduled jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Job not found.
    JobNotFound { job_id: JobId },
    /// The job's schedule cannot be evaluated.
    InvalidSchedule(ScheduleError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobNotFound { job_id } => write!(f, "scheduled job not found: {job_id}"),
            Self::InvalidSchedule(err) => write!(f, "invalid schedule: {err}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_error_display() {
        let trigger_id = TriggerId::new();
        let err = TriggerError::PathInUse {
            path: "/webhooks/orders".to_string(),
            trigger_id,
        };
        assert!(err.to_string().contains("/webhooks/orders"));
        assert!(err.to_string().contains(&trigger_id.to_string()));
    }

    #[test]
    fn schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "invalid".to_string(),
            reason: "expected 5 parts".to_string(),
        };
        assert!(err.to_string().contains("invalid"));
        assert!(err.to_string().contains("5 parts"));
    }

    #[test]
    fn scheduler_error_display() {
        let err = SchedulerError::InvalidSchedule(ScheduleError::InvalidInterval);
        assert_eq!(
            err.to_string(),
            "invalid schedule: interval must be greater than zero"
        );
    }
}
