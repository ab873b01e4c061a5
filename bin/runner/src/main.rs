mod bundle;
mod config;

use crate::config::RunnerConfig;
use copper_relay_scheduler::TriggerManager;
use copper_relay_workflow::{ExecutionEvent, WorkflowEngine};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let config = RunnerConfig::load().expect("failed to load configuration");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    tracing::info!(workflows_dir = %config.workflows_dir.display(), "Loaded configuration");

    let engine = WorkflowEngine::new(config.engine.clone());
    let manager = TriggerManager::new(engine.clone());

    // Log every run's lifecycle
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "execution event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let bundles = bundle::load_bundles(&config.workflows_dir)
        .await
        .expect("failed to load workflow bundles");
    for workflow in bundles {
        if let Err(e) = bundle::install(&manager, workflow) {
            tracing::error!(error = %e, "Skipping workflow");
        }
    }
    tracing::info!(
        workflows = engine.store().list_workflows().len(),
        triggers = manager.list_triggers(None).len(),
        jobs = manager.scheduler().list_jobs().len(),
        "Runner started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
    manager.shutdown();
}

fn log_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::NodeStarted {
            execution_id,
            node_id,
            attempt,
            ..
        } => tracing::debug!(%execution_id, %node_id, attempt, "node started"),
        ExecutionEvent::NodeFailed {
            execution_id,
            node_id,
            attempt,
            error,
            ..
        } => tracing::warn!(%execution_id, %node_id, attempt, %error, "node failed"),
        ExecutionEvent::NodeSkipped {
            execution_id,
            node_id,
            ..
        } => tracing::debug!(%execution_id, %node_id, "node skipped"),
        ExecutionEvent::RunStopped { execution_id, .. } => {
            tracing::info!(%execution_id, "run stopped");
        }
        other => tracing::trace!(execution_id = %other.execution_id(), ?other, "execution event"),
    }
}
