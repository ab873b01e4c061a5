//! Workflow bundles.
//!
//! A bundle is one JSON file holding a workflow definition and the
//! triggers that start it:
//!
//! ```json
//! {
//!   "workflow": { "name": "...", "nodes": [...], "connections": [...] },
//!   "triggers": [{ "type": "webhook", "config": { "path": "/orders" } }]
//! }
//! ```

use copper_relay_core::{TriggerId, WorkflowId};
use copper_relay_scheduler::{TriggerManager, TriggerType};
use copper_relay_workflow::WorkflowDefinition;
use rootcause::Report;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Errors from loading or installing bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    /// The file or directory could not be read.
    Read { path: PathBuf, reason: String },
    /// The file is not a valid bundle.
    Parse { path: PathBuf, reason: String },
    /// The workflow or one of its triggers was rejected.
    Install { workflow: String, reason: String },
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, reason } => {
                write!(f, "failed to read {}: {reason}", path.display())
            }
            Self::Parse { path, reason } => {
                write!(f, "invalid bundle {}: {reason}", path.display())
            }
            Self::Install { workflow, reason } => {
                write!(f, "failed to install workflow '{workflow}': {reason}")
            }
        }
    }
}

impl std::error::Error for BundleError {}

/// A trigger declared in a bundle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TriggerSpec {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub config: JsonValue,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A workflow and its triggers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkflowBundle {
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

/// Reads every `*.json` bundle in `dir`, in file name order. A missing
/// directory holds no bundles.
///
/// # Errors
///
/// Returns an error if the directory or a file cannot be read, or a file is
/// not a valid bundle.
pub async fn load_bundles(dir: &Path) -> Result<Vec<WorkflowBundle>, Report<BundleError>> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        warn!(dir = %dir.display(), "workflow directory does not exist");
        return Ok(Vec::new());
    }

    let read_error = |path: &Path, e: std::io::Error| BundleError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| read_error(dir, e))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| read_error(dir, e))? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut bundles = Vec::with_capacity(paths.len());
    for path in paths {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| read_error(&path, e))?;
        let bundle: WorkflowBundle =
            serde_json::from_str(&contents).map_err(|e| BundleError::Parse {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        debug!(path = %path.display(), workflow = %bundle.workflow.name, "bundle loaded");
        bundles.push(bundle);
    }
    Ok(bundles)
}

/// Registers the bundle's workflow and triggers. Triggers declared as
/// disabled are registered and then disabled.
///
/// Installation is all or nothing: if any trigger is rejected, the triggers
/// registered so far and the workflow are removed again.
///
/// # Errors
///
/// Returns an error if the workflow or a trigger is rejected.
pub fn install(
    manager: &TriggerManager,
    bundle: WorkflowBundle,
) -> Result<WorkflowId, Report<BundleError>> {
    let name = bundle.workflow.name.clone();
    let install_error = |reason: String| BundleError::Install {
        workflow: name.clone(),
        reason,
    };

    let workflow_id = manager
        .engine()
        .register_workflow(bundle.workflow)
        .map_err(|e| install_error(e.to_string()))?;
    let mut installed = Vec::with_capacity(bundle.triggers.len());
    for spec in bundle.triggers {
        let registered = manager
            .register_trigger(workflow_id, spec.trigger_type, spec.config)
            .map_err(|e| e.to_string())
            .and_then(|trigger_id| {
                installed.push(trigger_id);
                if spec.enabled {
                    Ok(())
                } else {
                    manager.disable_trigger(trigger_id).map_err(|e| e.to_string())
                }
            });
        if let Err(reason) = registered {
            roll_back(manager, workflow_id, &installed);
            return Err(install_error(reason).into());
        }
    }
    info!(%workflow_id, workflow = %name, "workflow installed");
    Ok(workflow_id)
}

fn roll_back(manager: &TriggerManager, workflow_id: WorkflowId, triggers: &[TriggerId]) {
    for &trigger_id in triggers {
        if let Err(e) = manager.unregister_trigger(trigger_id) {
            warn!(%trigger_id, error = %e, "failed to remove trigger during rollback");
        }
    }
    if let Err(e) = manager.engine().store().remove_workflow(workflow_id) {
        warn!(%workflow_id, error = %e, "failed to remove workflow during rollback");
    }
    debug!(%workflow_id, triggers = triggers.len(), "partial install rolled back");
}
