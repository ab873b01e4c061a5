//! Triggers and schedules for copper-relay workflows.
//!
//! This crate provides:
//!
//! - **Trigger Manager**: binds webhooks, events and schedules to workflows
//!   and turns their firings into runs
//! - **Scheduler**: recurring runs with one timer per job
//! - **Schedules**: cron expressions and fixed intervals, evaluated in UTC

pub mod error;
pub mod manager;
pub mod schedule;
pub mod scheduler;
pub mod trigger;

pub use error::{ScheduleError, SchedulerError, TriggerError};
pub use manager::TriggerManager;
pub use schedule::ScheduleSpec;
pub use scheduler::{JobRunner, ScheduledJob, Scheduler};
pub use trigger::{Trigger, TriggerType};
