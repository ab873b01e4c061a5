//! Workflow execution records.
//!
//! A [`WorkflowExecution`] is created when a run starts and is mutated only
//! by the engine driving that run. It moves through
//! `pending -> running -> {completed | failed | stopped}` and is terminal
//! once it leaves `running`. Steps are appended in completion order.

use crate::node::{NodeId, NodeType};
use chrono::{DateTime, Utc};
use copper_relay_core::{ExecutionId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The overall state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet started.
    Pending,
    /// Run is actively executing.
    Running,
    /// Every reachable node finished (failures tolerated by `continue`).
    Completed,
    /// A node failed, the run timed out or stalled.
    Failed,
    /// Stopped by an explicit request.
    Stopped,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The state of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// No incoming connection was traversed.
    Skipped,
}

/// Record of one node dispatch (or skip).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionStep {
    /// The node this step ran.
    pub node_id: NodeId,
    /// The node's type.
    pub node_type: NodeType,
    pub status: StepStatus,
    /// 1-based dispatch attempt for this node.
    pub attempt: u32,
    pub input: JsonValue,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecutionStep {
    /// Creates a step in the running state.
    #[must_use]
    pub fn started(node_id: NodeId, node_type: NodeType, attempt: u32, input: JsonValue) -> Self {
        Self {
            node_id,
            node_type,
            status: StepStatus::Running,
            attempt,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Creates a step for a node that was never dispatched.
    #[must_use]
    pub fn skipped(node_id: NodeId, node_type: NodeType) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            node_type,
            status: StepStatus::Skipped,
            attempt: 0,
            input: JsonValue::Null,
            output: None,
            error: None,
            started_at: now,
            finished_at: Some(now),
        }
    }

    /// Marks the step as completed.
    pub fn complete(&mut self, output: JsonValue) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
    }

    /// Marks the step as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }
}

/// A record of a single workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique identifier for this run.
    pub id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Current execution state.
    pub status: ExecutionStatus,
    /// When the run started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall time between start and finish.
    pub duration_ms: Option<u64>,
    /// Input data the run was started with.
    pub input: JsonValue,
    /// Final output of the run (if completed).
    pub output: Option<JsonValue>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Steps in completion order.
    pub steps: Vec<WorkflowExecutionStep>,
}

/// The trace returned by [`crate::WorkflowEngine::execute`].
pub type ExecutionTrace = WorkflowExecution;

impl WorkflowExecution {
    /// Creates a new execution in the pending state.
    #[must_use]
    pub fn new(id: ExecutionId, workflow_id: WorkflowId, input: JsonValue) -> Self {
        Self {
            id,
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            input,
            output: None,
            error: None,
            steps: Vec::new(),
        }
    }

    /// Starts the run.
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Marks the run as completed.
    pub fn complete(&mut self, output: JsonValue) {
        self.status = ExecutionStatus::Completed;
        self.output = Some(output);
        self.finish();
    }

    /// Marks the run as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.into());
        self.finish();
    }

    /// Marks the run as stopped. Completed steps are kept.
    pub fn stop(&mut self) {
        self.status = ExecutionStatus::Stopped;
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| u64::try_from((now - start).num_milliseconds()).unwrap_or(0));
    }

    /// Returns the steps recorded for one node, in attempt order.
    pub fn steps_for<'a>(
        &'a self,
        node_id: &'a NodeId,
    ) -> impl Iterator<Item = &'a WorkflowExecutionStep> + 'a {
        self.steps.iter().filter(move |step| &step.node_id == node_id)
    }
}
