//! Recurring workflow runs.
//!
//! Every enabled job owns one timer task. The task sleeps until the next
//! firing, records it on the job, and spawns the run without waiting for
//! it, so runs of one job may overlap. Disabling or unscheduling a job
//! aborts its timer.

use crate::error::SchedulerError;
use crate::schedule::ScheduleSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use copper_relay_core::{ExecutionId, JobId, WorkflowId};
use copper_relay_workflow::{ContextOverrides, WorkflowEngine};
use rootcause::Report;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Starts the run for one firing of a job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Returns the id of the started execution, if one was started.
    async fn run_job(&self, job: ScheduledJob) -> Option<ExecutionId>;
}

#[async_trait]
impl JobRunner for WorkflowEngine {
    async fn run_job(&self, job: ScheduledJob) -> Option<ExecutionId> {
        let input = json!({ "job_id": job.id, "fired_at": job.last_run });
        match self
            .run_workflow(job.workflow_id, input, Some(job.context))
            .await
        {
            Ok(trace) => Some(trace.id),
            Err(err) => {
                warn!(job_id = %job.id, workflow_id = %job.workflow_id, error = %err, "scheduled run could not start");
                None
            }
        }
    }
}

/// A workflow scheduled to run on a recurring schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub workflow_id: WorkflowId,
    pub spec: ScheduleSpec,
    /// Applied to every run the job starts.
    #[serde(default)]
    pub context: ContextOverrides,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    /// Unset while the job is disabled.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
}

struct JobEntry {
    job: ScheduledJob,
    runner: Arc<dyn JobRunner>,
    timer: Option<JoinHandle<()>>,
}

impl JobEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

type JobTable = Arc<Mutex<HashMap<JobId, JobEntry>>>;

/// Owns scheduled jobs and their timers.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    jobs: JobTable,
}

impl Scheduler {
    /// Creates a scheduler whose jobs run through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedules `workflow_id` and starts the job's timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule cannot be evaluated.
    pub fn schedule_workflow(
        &self,
        workflow_id: WorkflowId,
        spec: ScheduleSpec,
        context: ContextOverrides,
    ) -> Result<ScheduledJob, Report<SchedulerError>> {
        self.schedule_with_runner(workflow_id, spec, context, Arc::clone(&self.runner))
    }

    /// Like [`Scheduler::schedule_workflow`] but firings go to `runner`.
    pub(crate) fn schedule_with_runner(
        &self,
        workflow_id: WorkflowId,
        spec: ScheduleSpec,
        context: ContextOverrides,
        runner: Arc<dyn JobRunner>,
    ) -> Result<ScheduledJob, Report<SchedulerError>> {
        let now = Utc::now();
        let next_run = spec
            .next_after(now)
            .map_err(SchedulerError::InvalidSchedule)?;
        let job = ScheduledJob {
            id: JobId::new(),
            workflow_id,
            spec,
            context,
            enabled: true,
            created_at: now,
            next_run: Some(next_run),
            last_run: None,
            run_count: 0,
        };

        let mut jobs = self.lock_jobs();
        let timer = spawn_timer(Arc::clone(&self.jobs), job.id, job.spec.clone());
        jobs.insert(
            job.id,
            JobEntry {
                job: job.clone(),
                runner,
                timer: Some(timer),
            },
        );
        info!(job_id = %job.id, %workflow_id, schedule = %job.spec, %next_run, "workflow scheduled");
        Ok(job)
    }

    /// Removes a job and cancels its timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the job does not exist.
    pub fn unschedule_workflow(&self, job_id: JobId) -> Result<ScheduledJob, Report<SchedulerError>> {
        let mut entry = self
            .lock_jobs()
            .remove(&job_id)
            .ok_or(SchedulerError::JobNotFound { job_id })?;
        entry.cancel_timer();
        info!(%job_id, workflow_id = %entry.job.workflow_id, "workflow unscheduled");
        Ok(entry.job)
    }

    /// Recomputes the next run and restarts the job's timer. Enabling an
    /// enabled job changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the job does not exist or its schedule has no
    /// upcoming run.
    pub fn enable_job(&self, job_id: JobId) -> Result<ScheduledJob, Report<SchedulerError>> {
        let mut jobs = self.lock_jobs();
        let entry = jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobNotFound { job_id })?;
        if entry.job.enabled && entry.timer.is_some() {
            return Ok(entry.job.clone());
        }
        let next_run = entry
            .job
            .spec
            .next_after(Utc::now())
            .map_err(SchedulerError::InvalidSchedule)?;
        entry.job.enabled = true;
        entry.job.next_run = Some(next_run);
        entry.timer = Some(spawn_timer(
            Arc::clone(&self.jobs),
            job_id,
            entry.job.spec.clone(),
        ));
        debug!(%job_id, %next_run, "job enabled");
        Ok(entry.job.clone())
    }

    /// Cancels the job's timer and keeps the job.
    ///
    /// # Errors
    ///
    /// Returns an error if the job does not exist.
    pub fn disable_job(&self, job_id: JobId) -> Result<ScheduledJob, Report<SchedulerError>> {
        let mut jobs = self.lock_jobs();
        let entry = jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobNotFound { job_id })?;
        entry.cancel_timer();
        entry.job.enabled = false;
        entry.job.next_run = None;
        debug!(%job_id, "job disabled");
        Ok(entry.job.clone())
    }

    #[must_use]
    pub fn get_job(&self, job_id: JobId) -> Option<ScheduledJob> {
        self.lock_jobs().get(&job_id).map(|entry| entry.job.clone())
    }

    /// Lists jobs, oldest first.
    #[must_use]
    pub fn list_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<_> = self
            .lock_jobs()
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Cancels every timer and drops all jobs.
    pub fn shutdown(&self) {
        let mut jobs = self.lock_jobs();
        let count = jobs.len();
        for entry in jobs.values_mut() {
            entry.cancel_timer();
        }
        jobs.clear();
        info!(jobs = count, "scheduler shut down");
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn with_entry<R>(jobs: &JobTable, job_id: JobId, apply: impl FnOnce(&mut JobEntry) -> R) -> Option<R> {
    let mut jobs = jobs.lock().unwrap_or_else(PoisonError::into_inner);
    jobs.get_mut(&job_id).map(apply)
}

fn spawn_timer(jobs: JobTable, job_id: JobId, spec: ScheduleSpec) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (next_run, delay) = match spec.delay_from(Utc::now()) {
                Ok(next) => next,
                Err(err) => {
                    error!(%job_id, error = %err, "schedule has no next run, stopping timer");
                    return;
                }
            };
            if with_entry(&jobs, job_id, |entry| entry.job.next_run = Some(next_run)).is_none() {
                return;
            }

            tokio::time::sleep(delay).await;

            let fired = with_entry(&jobs, job_id, |entry| {
                entry.job.last_run = Some(Utc::now());
                entry.job.run_count += 1;
                (entry.job.clone(), Arc::clone(&entry.runner))
            });
            let Some((job, runner)) = fired else {
                return;
            };
            debug!(%job_id, workflow_id = %job.workflow_id, run = job.run_count, "job fired");
            tokio::spawn(async move {
                runner.run_job(job).await;
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use copper_relay_workflow::{
        ExecutionStatus, NodeConfig, WorkflowConnection, WorkflowDefinition, WorkflowNode,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingRunner {
        runs: Mutex<Vec<ScheduledJob>>,
    }

    impl CountingRunner {
        fn count(&self) -> usize {
            self.runs.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run_job(&self, job: ScheduledJob) -> Option<ExecutionId> {
            self.runs.lock().expect("lock").push(job);
            Some(ExecutionId::new())
        }
    }

    #[derive(Default)]
    struct SlowRunner {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for SlowRunner {
        async fn run_job(&self, _job: ScheduledJob) -> Option<ExecutionId> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2000)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    fn every_second() -> ScheduleSpec {
        ScheduleSpec::interval(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn interval_job_fires_each_period() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = Scheduler::new(runner.clone());
        let job = scheduler
            .schedule_workflow(
                WorkflowId::new(),
                every_second(),
                ContextOverrides::new().with_variable("tenant", json!("acme")),
            )
            .expect("schedules");
        assert!(job.next_run.is_some());

        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(runner.count(), 3);
        let job = scheduler.get_job(job.id).expect("job");
        assert_eq!(job.run_count, 3);
        assert!(job.last_run.is_some());
        let runs = runner.runs.lock().expect("lock");
        assert_eq!(runs[2].run_count, 3);
        assert_eq!(runs[0].context.variables["tenant"], "acme");
    }

    #[tokio::test(start_paused = true)]
    async fn disable_cancels_timer_and_enable_restarts_it() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = Scheduler::new(runner.clone());
        let job = scheduler
            .schedule_workflow(WorkflowId::new(), every_second(), ContextOverrides::new())
            .expect("schedules");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runner.count(), 1);

        let disabled = scheduler.disable_job(job.id).expect("disables");
        assert!(!disabled.enabled);
        assert!(disabled.next_run.is_none());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runner.count(), 1);

        let enabled = scheduler.enable_job(job.id).expect("enables");
        assert!(enabled.enabled);
        assert!(enabled.next_run.is_some());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(runner.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unschedule_removes_job() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = Scheduler::new(runner.clone());
        let job = scheduler
            .schedule_workflow(WorkflowId::new(), every_second(), ContextOverrides::new())
            .expect("schedules");

        let removed = scheduler.unschedule_workflow(job.id).expect("unschedules");
        assert_eq!(removed.id, job.id);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(runner.count(), 0);
        assert!(scheduler.list_jobs().is_empty());
        let err = scheduler.unschedule_workflow(job.id).unwrap_err();
        assert!(err.to_string().contains("scheduled job not found"));
        assert!(scheduler.enable_job(job.id).is_err());
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected() {
        let scheduler = Scheduler::new(Arc::new(CountingRunner::default()));
        let err = scheduler
            .schedule_workflow(
                WorkflowId::new(),
                ScheduleSpec::Interval { every_ms: 0 },
                ContextOverrides::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("interval must be greater than zero"));
        assert!(scheduler.list_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn runs_overlap_when_slower_than_the_period() {
        let runner = Arc::new(SlowRunner::default());
        let scheduler = Scheduler::new(runner.clone());
        scheduler
            .schedule_workflow(WorkflowId::new(), every_second(), ContextOverrides::new())
            .expect("schedules");

        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(runner.started.load(Ordering::SeqCst), 3);
        assert_eq!(runner.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_every_timer() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = Scheduler::new(runner.clone());
        for _ in 0..3 {
            scheduler
                .schedule_workflow(WorkflowId::new(), every_second(), ContextOverrides::new())
                .expect("schedules");
        }
        assert_eq!(scheduler.list_jobs().len(), 3);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(runner.count(), 0);
        assert!(scheduler.list_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_runs_scheduled_workflow() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("nightly")
            .with_node(WorkflowNode::new("start", NodeConfig::Start))
            .with_node(WorkflowNode::new("end", NodeConfig::End))
            .with_connection(WorkflowConnection::new("c1", "start", "end"));
        let workflow_id = engine.register_workflow(definition).expect("registers");

        let scheduler = Scheduler::new(Arc::new(engine.clone()));
        let job = scheduler
            .schedule_workflow(workflow_id, every_second(), ContextOverrides::new())
            .expect("schedules");

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let executions = engine.list_executions(Some(workflow_id));
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
        assert_eq!(executions[0].input["job_id"], json!(job.id));
    }
}
