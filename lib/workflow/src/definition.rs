//! Workflow definition types.
//!
//! A workflow definition is a named, versioned automation that consists of:
//! - Nodes (what to run)
//! - Connections (in which order, and under which conditions)
//! - Settings (timeout, retry policy, concurrency, error handling)
//!
//! Definitions are immutable once registered; the store only replaces them
//! through an explicit update.

use crate::edge::WorkflowConnection;
use crate::error::GraphError;
use crate::graph::WorkflowGraph;
use crate::node::{NodeId, WorkflowNode};
use chrono::{DateTime, Utc};
use copper_relay_core::WorkflowId;
use copper_relay_integration::RetryPolicy;
use serde::{Deserialize, Serialize};

/// What the engine does when a node dispatch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Fail the run at the first failed step.
    #[default]
    Stop,
    /// Record the failure and keep going; dependents see `{"error": ...}`.
    Continue,
    /// Re-dispatch the failed node per the retry policy, then stop.
    Retry,
}

/// Run-level settings of a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Fail the run if it is still going after this long.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Node re-dispatch policy used with [`ErrorHandling::Retry`].
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Maximum nodes dispatched at once within a run.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Failure handling mode.
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    #[serde(default)]
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Description of what this workflow does.
    #[serde(default)]
    pub description: Option<String>,
    /// Version of this definition.
    #[serde(default = "default_version")]
    pub version: String,
    /// Nodes; order is irrelevant.
    pub nodes: Vec<WorkflowNode>,
    /// Connections between nodes.
    #[serde(default)]
    pub connections: Vec<WorkflowConnection>,
    /// Run-level settings.
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// When this definition was last changed.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Creates an empty definition with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: None,
            version: default_version(),
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
            updated_at: Utc::now(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds a connection.
    #[must_use]
    pub fn with_connection(mut self, connection: WorkflowConnection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| &n.id == node_id)
    }

    /// Validates the definition and returns its graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is structurally invalid.
    pub fn validate(&self) -> Result<WorkflowGraph, GraphError> {
        WorkflowGraph::build(self)
    }

    /// Marks the definition as updated (bumps updated_at timestamp).
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Summary information about a workflow (for listings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Definition version.
    pub version: String,
    /// Description, if any.
    pub description: Option<String>,
    /// Number of nodes.
    pub node_count: usize,
    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(definition: &WorkflowDefinition) -> Self {
        Self {
            id: definition.id,
            name: definition.name.clone(),
            version: definition.version.clone(),
            description: definition.description.clone(),
            node_count: definition.nodes.len(),
            updated_at: definition.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use serde_json::json;

    #[test]
    fn builder_and_summary() {
        let definition = WorkflowDefinition::new("Greeter")
            .with_description("Says hello")
            .with_version("2.1.0")
            .with_node(WorkflowNode::new("start", NodeConfig::Start))
            .with_node(WorkflowNode::new("end", NodeConfig::End))
            .with_connection(WorkflowConnection::new("c1", "start", "end"));

        let summary = WorkflowSummary::from(&definition);
        assert_eq!(summary.name, "Greeter");
        assert_eq!(summary.version, "2.1.0");
        assert_eq!(summary.node_count, 2);
        assert!(definition.node(&NodeId::new("end")).is_some());
    }

    #[test]
    fn settings_default_to_stop_without_limits() {
        let settings = WorkflowSettings::default();
        assert_eq!(settings.error_handling, ErrorHandling::Stop);
        assert_eq!(settings.timeout_ms, None);
        assert_eq!(settings.max_concurrency, None);
    }

    #[test]
    fn minimal_json_definition_fills_defaults() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "minimal",
            "nodes": [{"id": "only", "config": {"type": "start"}}],
            "settings": {"error_handling": "continue", "timeout_ms": 5000}
        }))
        .expect("deserialize");

        assert_eq!(definition.version, "1.0.0");
        assert!(definition.connections.is_empty());
        assert_eq!(definition.settings.error_handling, ErrorHandling::Continue);
        assert_eq!(definition.settings.timeout_ms, Some(5000));
        assert!(definition.validate().is_ok());
    }
}
