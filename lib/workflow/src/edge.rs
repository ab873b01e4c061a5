//! Connections between workflow nodes.
//!
//! A connection carries a node's output to another node. It may name the
//! ports it leaves from and arrives at, and may carry a condition string
//! that must hold for the connection to be traversed.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// The source port that a condition node uses for its negative branch.
pub const FALSE_PORT: &str = "false";

/// The source port that a condition node uses for its positive branch.
pub const TRUE_PORT: &str = "true";

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConnection {
    /// Identifier, unique within the definition.
    pub id: String,
    /// The node the connection leaves from.
    pub source: NodeId,
    /// The node the connection arrives at.
    pub target: NodeId,
    /// Named output port on the source node.
    #[serde(default)]
    pub source_port: Option<String>,
    /// Named input port on the target node.
    #[serde(default)]
    pub target_port: Option<String>,
    /// Expression gating traversal, evaluated against the source's output.
    #[serde(default)]
    pub condition: Option<String>,
}

impl WorkflowConnection {
    /// Creates an unconditional connection with no named ports.
    #[must_use]
    pub fn new(id: impl Into<String>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_port: None,
            target_port: None,
            condition: None,
        }
    }

    /// Sets the source port.
    #[must_use]
    pub fn from_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }

    /// Sets the target port.
    #[must_use]
    pub fn to_port(mut self, port: impl Into<String>) -> Self {
        self.target_port = Some(port.into());
        self
    }

    /// Gates the connection on an expression.
    #[must_use]
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Returns whether this connection leaves through the negative port of a
    /// condition node.
    #[must_use]
    pub fn is_false_branch(&self) -> bool {
        self.source_port.as_deref() == Some(FALSE_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_ports_and_condition() {
        let conn = WorkflowConnection::new("c1", "check", "notify")
            .from_port(FALSE_PORT)
            .to_port("input")
            .when("score > 70");

        assert!(conn.is_false_branch());
        assert_eq!(conn.target_port.as_deref(), Some("input"));
        assert_eq!(conn.condition.as_deref(), Some("score > 70"));
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let conn: WorkflowConnection = serde_json::from_value(serde_json::json!({
            "id": "c1", "source": "a", "target": "b"
        }))
        .expect("deserialize");

        assert_eq!(conn, WorkflowConnection::new("c1", "a", "b"));
        assert!(!conn.is_false_branch());
    }
}
