//! Trigger manager.
//!
//! Maps external stimuli to workflow runs. While enabled, a trigger holds
//! one transport binding:
//!
//! - webhook triggers reserve a path
//! - event triggers subscribe to an event name
//! - schedule triggers own a scheduled job
//!
//! Other trigger types are fired directly by id. Disabling or unregistering
//! a trigger releases its binding, so nothing reaches a disabled trigger.

use crate::error::TriggerError;
use crate::schedule::ScheduleSpec;
use crate::scheduler::{JobRunner, ScheduledJob, Scheduler};
use crate::trigger::{Trigger, TriggerType};
use async_trait::async_trait;
use copper_relay_core::{ExecutionId, JobId, TriggerId, WorkflowId};
use copper_relay_workflow::{ContextOverrides, InMemoryRepository, Repository, WorkflowEngine};
use futures::future::join_all;
use rootcause::Report;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, instrument, warn};

/// Transport resource held by an enabled trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TriggerBinding {
    Webhook { path: String },
    Event { event_type: String },
    Schedule { job_id: JobId },
}

#[derive(Default)]
struct Bindings {
    by_trigger: HashMap<TriggerId, TriggerBinding>,
    webhooks: HashMap<String, TriggerId>,
    events: HashMap<String, Vec<TriggerId>>,
}

impl Bindings {
    /// Records `binding` for `trigger_id`, releasing and returning whatever
    /// the trigger held before.
    fn insert(&mut self, trigger_id: TriggerId, binding: TriggerBinding) -> Option<TriggerBinding> {
        let displaced = self.release(trigger_id);
        match &binding {
            TriggerBinding::Webhook { path } => {
                self.webhooks.insert(path.clone(), trigger_id);
            }
            TriggerBinding::Event { event_type } => {
                let subscribers = self.events.entry(event_type.clone()).or_default();
                if !subscribers.contains(&trigger_id) {
                    subscribers.push(trigger_id);
                }
            }
            TriggerBinding::Schedule { .. } => {}
        }
        self.by_trigger.insert(trigger_id, binding);
        displaced
    }

    fn release(&mut self, trigger_id: TriggerId) -> Option<TriggerBinding> {
        let binding = self.by_trigger.remove(&trigger_id)?;
        match &binding {
            TriggerBinding::Webhook { path } => {
                self.webhooks.remove(path);
            }
            TriggerBinding::Event { event_type } => {
                if let Some(subscribers) = self.events.get_mut(event_type) {
                    subscribers.retain(|id| *id != trigger_id);
                    if subscribers.is_empty() {
                        self.events.remove(event_type);
                    }
                }
            }
            TriggerBinding::Schedule { .. } => {}
        }
        Some(binding)
    }
}

struct Inner {
    engine: WorkflowEngine,
    scheduler: Scheduler,
    triggers: Arc<dyn Repository<TriggerId, Trigger>>,
    bindings: Mutex<Bindings>,
}

/// Registers triggers and turns their firings into workflow runs.
///
/// Cloning is cheap; clones share every trigger and binding.
#[derive(Clone)]
pub struct TriggerManager {
    inner: Arc<Inner>,
}

impl TriggerManager {
    /// Creates a manager that runs workflows on `engine`. Scheduled jobs
    /// created through the manager's scheduler run on the same engine.
    #[must_use]
    pub fn new(engine: WorkflowEngine) -> Self {
        let scheduler = Scheduler::new(Arc::new(engine.clone()));
        Self {
            inner: Arc::new(Inner {
                engine,
                scheduler,
                triggers: Arc::new(InMemoryRepository::new()),
                bindings: Mutex::new(Bindings::default()),
            }),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &WorkflowEngine {
        &self.inner.engine
    }

    /// The scheduler backing schedule triggers.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Registers an enabled trigger and binds its transport.
    ///
    /// Webhook triggers take their path from `config.path` (normalized,
    /// defaulting to `/webhooks/<trigger id>`). Event triggers need
    /// `config.event`. Schedule triggers need a cron expression or an
    /// interval, see [`ScheduleSpec::from_config`].
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow is not registered, the config is
    /// invalid, or the webhook path is taken.
    #[instrument(skip(self, config))]
    pub fn register_trigger(
        &self,
        workflow_id: WorkflowId,
        trigger_type: TriggerType,
        config: JsonValue,
    ) -> Result<TriggerId, Report<TriggerError>> {
        self.inner
            .engine
            .store()
            .get_workflow(workflow_id)
            .map_err(|_| TriggerError::WorkflowNotFound { workflow_id })?;

        let mut trigger = Trigger::new(workflow_id, trigger_type, config);
        let mut bindings = self.lock_bindings();
        self.bind(&mut bindings, &mut trigger)?;
        let trigger_id = trigger.id;
        self.inner.triggers.put(trigger_id, trigger);
        drop(bindings);
        info!(%trigger_id, "trigger registered");
        Ok(trigger_id)
    }

    /// Removes a trigger and releases its binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger does not exist.
    pub fn unregister_trigger(&self, trigger_id: TriggerId) -> Result<Trigger, Report<TriggerError>> {
        let mut bindings = self.lock_bindings();
        let trigger = self
            .inner
            .triggers
            .delete(&trigger_id)
            .ok_or(TriggerError::NotFound { trigger_id })?;
        self.unbind(&mut bindings, trigger_id);
        drop(bindings);
        info!(%trigger_id, workflow_id = %trigger.workflow_id, "trigger unregistered");
        Ok(trigger)
    }

    /// Re-binds a disabled trigger's transport and enables it.
    ///
    /// The bindings lock is held from the `enabled` check until the flag
    /// flips, so concurrent callers bind at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger does not exist or its transport can
    /// no longer be bound (e.g. another trigger took the webhook path).
    pub fn enable_trigger(&self, trigger_id: TriggerId) -> Result<(), Report<TriggerError>> {
        let mut bindings = self.lock_bindings();
        let mut trigger = self.get_trigger(trigger_id).ok_or(TriggerError::NotFound { trigger_id })?;
        if trigger.enabled {
            return Ok(());
        }
        self.bind(&mut bindings, &mut trigger)?;
        let config = trigger.config;
        self.inner.triggers.update(&trigger_id, &mut |stored| {
            stored.enabled = true;
            stored.config = config.clone();
        });
        drop(bindings);
        debug!(%trigger_id, "trigger enabled");
        Ok(())
    }

    /// Releases a trigger's transport and disables it.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger does not exist.
    pub fn disable_trigger(&self, trigger_id: TriggerId) -> Result<(), Report<TriggerError>> {
        let mut bindings = self.lock_bindings();
        let trigger = self.get_trigger(trigger_id).ok_or(TriggerError::NotFound { trigger_id })?;
        if !trigger.enabled {
            return Ok(());
        }
        self.unbind(&mut bindings, trigger_id);
        self.inner
            .triggers
            .update(&trigger_id, &mut |stored| stored.enabled = false);
        drop(bindings);
        debug!(%trigger_id, "trigger disabled");
        Ok(())
    }

    #[must_use]
    pub fn get_trigger(&self, trigger_id: TriggerId) -> Option<Trigger> {
        self.inner.triggers.get(&trigger_id)
    }

    /// Lists triggers in registration order, optionally for one workflow.
    #[must_use]
    pub fn list_triggers(&self, workflow_id: Option<WorkflowId>) -> Vec<Trigger> {
        self.inner
            .triggers
            .list()
            .into_iter()
            .filter(|trigger| workflow_id.is_none_or(|id| trigger.workflow_id == id))
            .collect()
    }

    /// Fires a trigger and waits for the run.
    ///
    /// The run's context takes `overrides` plus the trigger metadata under
    /// the `trigger` variable. Returns `None` when the trigger is missing or
    /// disabled, or its workflow is no longer registered.
    #[instrument(skip(self, input, overrides))]
    pub async fn trigger_workflow(
        &self,
        trigger_id: TriggerId,
        input: JsonValue,
        overrides: Option<ContextOverrides>,
    ) -> Option<ExecutionId> {
        let mut fired = None;
        self.inner.triggers.update(&trigger_id, &mut |trigger| {
            if trigger.enabled {
                trigger.record_firing();
                fired = Some(trigger.clone());
            }
        });
        let Some(trigger) = fired else {
            warn!("trigger missing or disabled, firing ignored");
            return None;
        };

        let overrides = overrides
            .unwrap_or_default()
            .with_variable("trigger", trigger.metadata());
        info!(
            workflow_id = %trigger.workflow_id,
            trigger_type = %trigger.trigger_type,
            count = trigger.trigger_count,
            "trigger fired"
        );
        match self
            .inner
            .engine
            .run_workflow(trigger.workflow_id, input, Some(overrides))
            .await
        {
            Ok(trace) => Some(trace.id),
            Err(err) => {
                warn!(workflow_id = %trigger.workflow_id, error = %err, "trigger could not start run");
                None
            }
        }
    }

    /// Fires the trigger bound to a webhook path.
    ///
    /// The payload becomes the run input; the request is available to the
    /// run as the `webhook` variable (`path` and `headers`).
    pub async fn handle_webhook(
        &self,
        path: &str,
        payload: JsonValue,
        headers: HashMap<String, String>,
    ) -> Option<ExecutionId> {
        let path = normalize_path(path);
        let trigger_id = self.lock_bindings().webhooks.get(&path).copied();
        let Some(trigger_id) = trigger_id else {
            debug!(%path, "no trigger bound to webhook path");
            return None;
        };
        let overrides = ContextOverrides::new()
            .with_variable("webhook", json!({ "path": path, "headers": headers }));
        self.trigger_workflow(trigger_id, payload, Some(overrides))
            .await
    }

    /// Fires every trigger subscribed to `event_type` concurrently and
    /// returns the ids of the runs that started.
    pub async fn emit_event(&self, event_type: &str, data: JsonValue) -> Vec<ExecutionId> {
        let subscribers = self
            .lock_bindings()
            .events
            .get(event_type)
            .cloned()
            .unwrap_or_default();
        if subscribers.is_empty() {
            debug!(%event_type, "no triggers subscribed to event");
            return Vec::new();
        }

        let firings = subscribers.into_iter().map(|trigger_id| {
            let overrides =
                ContextOverrides::new().with_variable("event", json!({ "type": event_type }));
            self.trigger_workflow(trigger_id, data.clone(), Some(overrides))
        });
        join_all(firings).await.into_iter().flatten().collect()
    }

    /// Runs a workflow on demand, without a registered trigger.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow is not registered.
    pub async fn manual_trigger(
        &self,
        workflow_id: WorkflowId,
        input: JsonValue,
        overrides: Option<ContextOverrides>,
    ) -> Result<ExecutionId, Report<TriggerError>> {
        let overrides = overrides.unwrap_or_default().with_variable(
            "trigger",
            json!({ "id": null, "type": TriggerType::Manual, "config": {} }),
        );
        info!(%workflow_id, "manual trigger");
        let trace = self
            .inner
            .engine
            .run_workflow(workflow_id, input, Some(overrides))
            .await
            .map_err(|_| TriggerError::WorkflowNotFound { workflow_id })?;
        Ok(trace.id)
    }

    /// Cancels every scheduled job.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }

    fn bind(&self, bindings: &mut Bindings, trigger: &mut Trigger) -> Result<(), Report<TriggerError>> {
        let binding = match trigger.trigger_type {
            TriggerType::Webhook => {
                let path = trigger
                    .config
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .map_or_else(|| format!("/webhooks/{}", trigger.id), normalize_path);
                if let Some(&owner) = bindings.webhooks.get(&path)
                    && owner != trigger.id
                {
                    return Err(TriggerError::PathInUse {
                        path,
                        trigger_id: owner,
                    }
                    .into());
                }
                match &mut trigger.config {
                    JsonValue::Object(config) => {
                        config.insert("path".to_string(), JsonValue::String(path.clone()));
                    }
                    config => *config = json!({ "path": path }),
                }
                TriggerBinding::Webhook { path }
            }
            TriggerType::Event => {
                let event_type = trigger
                    .config
                    .get("event")
                    .or_else(|| trigger.config.get("event_type"))
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| TriggerError::InvalidConfig {
                        reason: "event triggers need an `event` name".to_string(),
                    })?;
                TriggerBinding::Event {
                    event_type: event_type.to_string(),
                }
            }
            TriggerType::Schedule => {
                let spec = ScheduleSpec::from_config(&trigger.config)
                    .map_err(|e| TriggerError::InvalidConfig { reason: e.to_string() })?;
                let runner = Arc::new(ScheduledFiring {
                    manager: Arc::downgrade(&self.inner),
                    trigger_id: trigger.id,
                });
                let job = self
                    .inner
                    .scheduler
                    .schedule_with_runner(trigger.workflow_id, spec, ContextOverrides::new(), runner)
                    .map_err(|e| TriggerError::InvalidConfig { reason: e.to_string() })?;
                TriggerBinding::Schedule { job_id: job.id }
            }
            TriggerType::Manual
            | TriggerType::Form
            | TriggerType::FileUpload
            | TriggerType::FormSubmission
            | TriggerType::IotStream
            | TriggerType::BehavioralTracking => return Ok(()),
        };
        debug!(trigger_id = %trigger.id, ?binding, "trigger bound");
        if let Some(displaced) = bindings.insert(trigger.id, binding) {
            self.cancel_job(trigger.id, displaced);
        }
        Ok(())
    }

    fn unbind(&self, bindings: &mut Bindings, trigger_id: TriggerId) {
        if let Some(released) = bindings.release(trigger_id) {
            self.cancel_job(trigger_id, released);
        }
        debug!(%trigger_id, "trigger unbound");
    }

    fn cancel_job(&self, trigger_id: TriggerId, binding: TriggerBinding) {
        if let TriggerBinding::Schedule { job_id } = binding
            && let Err(err) = self.inner.scheduler.unschedule_workflow(job_id)
        {
            warn!(%trigger_id, %job_id, error = %err, "scheduled job already gone");
        }
    }

    fn lock_bindings(&self) -> MutexGuard<'_, Bindings> {
        self.inner
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes a scheduled job's firings through its trigger.
struct ScheduledFiring {
    manager: Weak<Inner>,
    trigger_id: TriggerId,
}

#[async_trait]
impl JobRunner for ScheduledFiring {
    async fn run_job(&self, job: ScheduledJob) -> Option<ExecutionId> {
        let manager = TriggerManager {
            inner: self.manager.upgrade()?,
        };
        let fired_at = job.last_run;
        let overrides = job.context.with_variable(
            "schedule",
            json!({ "job_id": job.id, "fired_at": fired_at, "run_count": job.run_count }),
        );
        manager
            .trigger_workflow(self.trigger_id, json!({ "fired_at": fired_at }), Some(overrides))
            .await
    }
}

/// Leading `/`, no trailing `/`, surrounding whitespace removed.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}
