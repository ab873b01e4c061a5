//! Workflow node types and configurations.
//!
//! Nodes are the building blocks of workflows. Each node has:
//! - An author-chosen id, unique within its definition
//! - A configuration whose variant is the node's type
//! - A layout position used only by editors

use crate::condition::Condition;
use crate::transform::TransformConfig;
use copper_relay_integration::{ActionDefinition, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Identifier for a node within a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Editor position. Has no effect on execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// The type of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Start,
    End,
    Agent,
    Integration,
    Transform,
    Condition,
    Delay,
    Parallel,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trigger => "trigger",
            Self::Start => "start",
            Self::End => "end",
            Self::Agent => "agent",
            Self::Integration => "integration",
            Self::Transform => "transform",
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::Parallel => "parallel",
        };
        f.write_str(name)
    }
}

/// Configuration for integration nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrationNodeConfig {
    /// Call an operation on a registered connector.
    Connector {
        /// The connector to call (e.g., "slack", "crm").
        connector_id: String,
        /// The operation to perform.
        action: String,
        /// Operation parameters; `${...}` placeholders are resolved first.
        /// When absent the node input is passed through.
        #[serde(default)]
        parameters: Option<JsonValue>,
        /// Retries for transient connector failures.
        #[serde(default)]
        retry_policy: RetryPolicy,
    },
    /// Run a typed leaf action through the action executor.
    Action {
        /// The action to run.
        action: ActionDefinition,
    },
}

/// A sub-branch of a parallel node: nodes run one after another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranch {
    /// Branch name used in errors.
    pub name: String,
    /// Nodes run in order; each receives the previous node's output.
    pub nodes: Vec<WorkflowNode>,
}

/// Configuration for a node, one variant per node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Marks where a trigger enters the graph. Passes its input through.
    Trigger,
    /// Explicit entry point. Passes its input through.
    Start,
    /// Explicit exit point. Passes its input through.
    End,
    /// Delegates to the agent collaborator.
    Agent {
        /// The agent to invoke.
        agent_id: String,
        /// Input template; `${...}` placeholders are resolved against the
        /// node scope. When absent the node input is passed as-is.
        #[serde(default)]
        input: Option<JsonValue>,
    },
    /// Delegates to the integration collaborator or the action executor.
    Integration(IntegrationNodeConfig),
    /// Declarative data transformation.
    Transform(TransformConfig),
    /// Boolean predicate deciding which outgoing connections are traversed.
    Condition {
        /// The predicate.
        condition: Condition,
    },
    /// Waits before passing its input through.
    Delay {
        /// How long to wait.
        duration_ms: u64,
    },
    /// Runs sub-branches concurrently and collects their outputs.
    Parallel {
        /// The branches, in output order.
        branches: Vec<ParallelBranch>,
    },
}

impl NodeConfig {
    /// Returns the node type of this configuration.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Trigger => NodeType::Trigger,
            Self::Start => NodeType::Start,
            Self::End => NodeType::End,
            Self::Agent { .. } => NodeType::Agent,
            Self::Integration(_) => NodeType::Integration,
            Self::Transform(_) => NodeType::Transform,
            Self::Condition { .. } => NodeType::Condition,
            Self::Delay { .. } => NodeType::Delay,
            Self::Parallel { .. } => NodeType::Parallel,
        }
    }
}

/// A workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier for this node within the workflow.
    pub id: NodeId,
    /// Human-readable label.
    #[serde(default)]
    pub name: Option<String>,
    /// Node configuration (determines type and behavior).
    pub config: NodeConfig,
    /// Editor position.
    #[serde(default)]
    pub position: Position,
}

impl WorkflowNode {
    /// Creates a node at the origin.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            config,
            position: Position::default(),
        }
    }

    /// Sets the label.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the editor position.
    #[must_use]
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    /// Returns the type of this node.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
