//! Validated workflow graph built with petgraph.
//!
//! A [`WorkflowGraph`] is derived from a [`WorkflowDefinition`] and is the
//! only way the engine looks at structure. Building it enforces every
//! structural invariant, so a definition that produced a graph is safe to
//! execute:
//! - node and connection ids are unique
//! - every connection references existing nodes
//! - at least one entry node (no incoming connection) exists
//! - the graph is acyclic
//! - connection conditions and node predicates parse

use crate::definition::WorkflowDefinition;
use crate::error::GraphError;
use crate::expression::Expression;
use crate::node::{NodeConfig, NodeId, WorkflowNode};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

/// Structure of a validated definition.
///
/// Node weights are node ids; edge weights are indexes into the
/// definition's `connections`.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<NodeId, usize>,
    node_index_map: HashMap<NodeId, NodeIndex>,
    conditions: Vec<Option<Expression>>,
}

impl WorkflowGraph {
    /// Builds and validates the graph of `definition`.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        if definition.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut node_index_map = HashMap::new();
        for node in &definition.nodes {
            if node_index_map.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
            validate_node(node)?;
            let index = graph.add_node(node.id.clone());
            node_index_map.insert(node.id.clone(), index);
        }

        let mut seen_connections = HashSet::new();
        let mut conditions = Vec::with_capacity(definition.connections.len());
        for (position, connection) in definition.connections.iter().enumerate() {
            if !seen_connections.insert(connection.id.as_str()) {
                return Err(GraphError::DuplicateConnection {
                    connection_id: connection.id.clone(),
                });
            }

            let endpoint = |node_id: &NodeId| {
                node_index_map
                    .get(node_id)
                    .copied()
                    .ok_or_else(|| GraphError::DanglingConnection {
                        connection_id: connection.id.clone(),
                        node_id: node_id.clone(),
                    })
            };
            let source = endpoint(&connection.source)?;
            let target = endpoint(&connection.target)?;

            let condition = connection
                .condition
                .as_deref()
                .map(Expression::parse)
                .transpose()
                .map_err(|e| GraphError::InvalidConnectionCondition {
                    connection_id: connection.id.clone(),
                    reason: e.to_string(),
                })?;
            conditions.push(condition);

            graph.add_edge(source, target, position);
        }

        let workflow_graph = Self {
            graph,
            node_index_map,
            conditions,
        };

        if workflow_graph.entry_nodes().is_empty() {
            return Err(GraphError::NoEntryNodes);
        }

        if petgraph::algo::is_cyclic_directed(&workflow_graph.graph) {
            return Err(GraphError::CycleDetected);
        }

        Ok(workflow_graph)
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of connections in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns all node ids in definition order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.graph.node_weights()
    }

    /// Returns nodes that have no incoming connections (entry points).
    #[must_use]
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Incoming)
    }

    /// Returns nodes that have no outgoing connections (terminal nodes).
    #[must_use]
    pub fn terminal_nodes(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Outgoing)
    }

    fn nodes_without(&self, direction: Direction) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, direction).next().is_none())
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect()
    }

    /// Returns the connection indexes arriving at `node_id`.
    #[must_use]
    pub fn incoming(&self, node_id: &NodeId) -> Vec<usize> {
        self.connections(node_id, Direction::Incoming)
    }

    /// Returns the connection indexes leaving `node_id`.
    #[must_use]
    pub fn outgoing(&self, node_id: &NodeId) -> Vec<usize> {
        self.connections(node_id, Direction::Outgoing)
    }

    fn connections(&self, node_id: &NodeId, direction: Direction) -> Vec<usize> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };
        let mut connections: Vec<usize> = self
            .graph
            .edges_directed(index, direction)
            .map(|edge| *edge.weight())
            .collect();
        connections.sort_unstable();
        connections
    }

    /// Returns the parsed condition of a connection, if it has one.
    #[must_use]
    pub fn condition(&self, connection: usize) -> Option<&Expression> {
        self.conditions.get(connection).and_then(Option::as_ref)
    }
}

/// Validates the parts of a node's configuration that can be checked
/// without running it.
fn validate_node(node: &WorkflowNode) -> Result<(), GraphError> {
    let invalid = |reason: String| GraphError::InvalidNodeConfig {
        node_id: node.id.clone(),
        reason,
    };

    match &node.config {
        NodeConfig::Condition { condition } => {
            condition.validate().map_err(|e| invalid(e.to_string()))
        }
        NodeConfig::Transform(transform) => {
            transform.validate().map_err(|e| invalid(e.to_string()))
        }
        NodeConfig::Parallel { branches } => {
            if branches.is_empty() {
                return Err(invalid("parallel node declares no branches".to_string()));
            }
            for branch in branches {
                if branch.nodes.is_empty() {
                    return Err(invalid(format!("branch '{}' has no nodes", branch.name)));
                }
                for inner in &branch.nodes {
                    validate_node(inner)?;
                }
            }
            Ok(())
        }
        NodeConfig::Trigger
        | NodeConfig::Start
        | NodeConfig::End
        | NodeConfig::Agent { .. }
        | NodeConfig::Integration(_)
        | NodeConfig::Delay { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, PatternOperator};
    use crate::edge::WorkflowConnection;
    use crate::node::ParallelBranch;
    use serde_json::json;

    fn linear(ids: &[&str]) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new("linear");
        for id in ids {
            definition = definition.with_node(WorkflowNode::new(*id, NodeConfig::Start));
        }
        for pair in ids.windows(2) {
            definition = definition.with_connection(WorkflowConnection::new(
                format!("{}-{}", pair[0], pair[1]),
                pair[0],
                pair[1],
            ));
        }
        definition
    }

    #[test]
    fn linear_graph_has_one_entry_and_one_terminal() {
        let graph = WorkflowGraph::build(&linear(&["a", "b", "c"])).expect("valid");

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.entry_nodes(), vec![NodeId::new("a")]);
        assert_eq!(graph.terminal_nodes(), vec![NodeId::new("c")]);
        assert_eq!(graph.incoming(&NodeId::new("b")), vec![0]);
        assert_eq!(graph.outgoing(&NodeId::new("b")), vec![1]);
    }

    #[test]
    fn rejects_dangling_connection() {
        let definition =
            linear(&["a", "b"]).with_connection(WorkflowConnection::new("bad", "b", "ghost"));

        let err = WorkflowGraph::build(&definition).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingConnection {
                connection_id: "bad".to_string(),
                node_id: NodeId::new("ghost"),
            }
        );
    }

    #[test]
    fn rejects_cycle_reachable_from_entry() {
        let definition = linear(&["a", "b", "c"])
            .with_connection(WorkflowConnection::new("back", "c", "b"));

        assert_eq!(
            WorkflowGraph::build(&definition).unwrap_err(),
            GraphError::CycleDetected
        );
    }

    #[test]
    fn rejects_graph_without_entry_nodes() {
        let definition = linear(&["a", "b"]).with_connection(WorkflowConnection::new("loop", "b", "a"));

        assert_eq!(
            WorkflowGraph::build(&definition).unwrap_err(),
            GraphError::NoEntryNodes
        );
    }

    #[test]
    fn rejects_self_loop() {
        let definition = linear(&["a", "b"]).with_connection(WorkflowConnection::new("self", "b", "b"));

        assert_eq!(
            WorkflowGraph::build(&definition).unwrap_err(),
            GraphError::CycleDetected
        );
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let definition = linear(&["a", "a"]);
        assert!(matches!(
            WorkflowGraph::build(&definition),
            Err(GraphError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn rejects_empty_definition() {
        assert_eq!(
            WorkflowGraph::build(&WorkflowDefinition::new("empty")).unwrap_err(),
            GraphError::Empty
        );
    }

    #[test]
    fn parses_connection_conditions() {
        let definition = WorkflowDefinition::new("gated")
            .with_node(WorkflowNode::new("a", NodeConfig::Start))
            .with_node(WorkflowNode::new("b", NodeConfig::End))
            .with_connection(WorkflowConnection::new("c1", "a", "b").when("score > 70"));

        let graph = WorkflowGraph::build(&definition).expect("valid");
        let condition = graph.condition(0).expect("parsed");
        assert!(condition.evaluate_bool(&json!({"score": 80})));
    }

    #[test]
    fn rejects_malformed_connection_condition() {
        let definition = WorkflowDefinition::new("gated")
            .with_node(WorkflowNode::new("a", NodeConfig::Start))
            .with_node(WorkflowNode::new("b", NodeConfig::End))
            .with_connection(WorkflowConnection::new("c1", "a", "b").when("score >"));

        assert!(matches!(
            WorkflowGraph::build(&definition),
            Err(GraphError::InvalidConnectionCondition { .. })
        ));
    }

    #[test]
    fn rejects_invalid_condition_node_pattern() {
        let node = WorkflowNode::new(
            "check",
            NodeConfig::Condition {
                condition: Condition::Pattern {
                    operator: PatternOperator::Regex,
                    value: json!("$email"),
                    pattern: "([a-z".to_string(),
                },
            },
        );
        let definition = WorkflowDefinition::new("bad regex").with_node(node);

        assert!(matches!(
            WorkflowGraph::build(&definition),
            Err(GraphError::InvalidNodeConfig { .. })
        ));
    }

    #[test]
    fn rejects_empty_parallel_branch() {
        let node = WorkflowNode::new(
            "fan",
            NodeConfig::Parallel {
                branches: vec![ParallelBranch {
                    name: "left".to_string(),
                    nodes: vec![],
                }],
            },
        );
        let definition = WorkflowDefinition::new("fan").with_node(node);

        assert!(matches!(
            WorkflowGraph::build(&definition),
            Err(GraphError::InvalidNodeConfig { .. })
        ));
    }
}
