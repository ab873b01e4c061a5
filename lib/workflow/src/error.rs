//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: Structural problems found while validating a definition
//! - `ExpressionError`, `ConditionError`, `TransformError`: Evaluator failures
//! - `AgentError`: Failures reported by the agent collaborator
//! - `NodeDispatchError`: A single node dispatch failed
//! - `ExecutionError`: Why a run ended in `failed`
//! - `WorkflowError`: High-level store and engine operations

use crate::node::NodeId;
use copper_relay_core::{ExecutionId, WorkflowId};
use std::fmt;

/// Structural errors in a workflow definition.
///
/// These errors contain only information available at the graph layer.
/// Workflow-level context (like workflow_id) is added by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share an id.
    DuplicateNode { node_id: NodeId },
    /// Two connections share an id.
    DuplicateConnection { connection_id: String },
    /// A connection references a node that does not exist.
    DanglingConnection {
        connection_id: String,
        node_id: NodeId,
    },
    /// Every node has an incoming connection.
    NoEntryNodes,
    /// The definition has no nodes at all.
    Empty,
    /// Graph contains cycles.
    CycleDetected,
    /// A connection's condition string does not parse.
    InvalidConnectionCondition {
        connection_id: String,
        reason: String,
    },
    /// A node's configuration is unusable.
    InvalidNodeConfig { node_id: NodeId, reason: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::DuplicateConnection { connection_id } => {
                write!(f, "duplicate connection id: {connection_id}")
            }
            Self::DanglingConnection {
                connection_id,
                node_id,
            } => {
                write!(
                    f,
                    "connection {connection_id} references missing node {node_id}"
                )
            }
            Self::NoEntryNodes => write!(f, "workflow has no entry nodes"),
            Self::Empty => write!(f, "workflow has no nodes"),
            Self::CycleDetected => write!(f, "graph contains cycles"),
            Self::InvalidConnectionCondition {
                connection_id,
                reason,
            } => {
                write!(f, "invalid condition on connection {connection_id}: {reason}")
            }
            Self::InvalidNodeConfig { node_id, reason } => {
                write!(f, "invalid configuration for node {node_id}: {reason}")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from parsing an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    /// The expression is empty.
    Empty,
    /// A character that cannot start any token.
    UnexpectedCharacter { character: char, position: usize },
    /// A string literal is missing its closing quote.
    UnterminatedString { position: usize },
    /// The token stream does not form a valid expression.
    UnexpectedToken { found: String },
    /// The expression ended while more input was expected.
    UnexpectedEnd,
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty expression"),
            Self::UnexpectedCharacter {
                character,
                position,
            } => {
                write!(f, "unexpected character '{character}' at {position}")
            }
            Self::UnterminatedString { position } => {
                write!(f, "unterminated string starting at {position}")
            }
            Self::UnexpectedToken { found } => write!(f, "unexpected token: {found}"),
            Self::UnexpectedEnd => write!(f, "unexpected end of expression"),
        }
    }
}

impl std::error::Error for ExpressionError {}

/// Errors from evaluating a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// A regex or glob pattern does not compile.
    InvalidPattern { pattern: String, reason: String },
    /// A `not` condition must wrap exactly one condition.
    InvalidArity { expected: usize, found: usize },
    /// A custom expression does not parse.
    Expression(ExpressionError),
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPattern { pattern, reason } => {
                write!(f, "invalid pattern '{pattern}': {reason}")
            }
            Self::InvalidArity { expected, found } => {
                write!(f, "expected {expected} sub-condition(s), found {found}")
            }
            Self::Expression(err) => write!(f, "invalid expression: {err}"),
        }
    }
}

impl std::error::Error for ConditionError {}

impl From<ExpressionError> for ConditionError {
    fn from(err: ExpressionError) -> Self {
        Self::Expression(err)
    }
}

/// Errors from applying a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// A field-level operation could not be applied.
    OperationFailed {
        field: String,
        operation: String,
        reason: String,
    },
    /// A map transform requires an object input.
    NotAnObject,
    /// The transform expression does not parse.
    Expression(ExpressionError),
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperationFailed {
                field,
                operation,
                reason,
            } => {
                write!(f, "{operation} failed on '{field}': {reason}")
            }
            Self::NotAnObject => write!(f, "transform input must be an object"),
            Self::Expression(err) => write!(f, "invalid transform expression: {err}"),
        }
    }
}

impl std::error::Error for TransformError {}

impl From<ExpressionError> for TransformError {
    fn from(err: ExpressionError) -> Self {
        Self::Expression(err)
    }
}

/// Errors reported by the agent collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// No agent exists with the given id.
    NotFound { agent_id: String },
    /// The agent could not complete the request.
    Failed { reason: String },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { agent_id } => write!(f, "agent not found: {agent_id}"),
            Self::Failed { reason } => write!(f, "agent failed: {reason}"),
        }
    }
}

impl std::error::Error for AgentError {}

/// Errors from dispatching a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeDispatchError {
    /// The node needs a collaborator the engine was built without.
    CollaboratorMissing { collaborator: &'static str },
    /// The agent collaborator failed.
    Agent { agent_id: String, reason: String },
    /// The integration collaborator failed.
    Integration {
        connector_id: String,
        action: String,
        reason: String,
        retries: u32,
    },
    /// A leaf action failed after exhausting its retries.
    Action {
        action_id: String,
        reason: String,
        retries: u32,
    },
    /// A condition node could not be evaluated.
    Condition(ConditionError),
    /// A transform node could not be applied.
    Transform(TransformError),
    /// A branch of a parallel node failed.
    Branch { branch: String, reason: String },
}

impl fmt::Display for NodeDispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CollaboratorMissing { collaborator } => {
                write!(f, "no {collaborator} collaborator configured")
            }
            Self::Agent { agent_id, reason } => write!(f, "agent {agent_id}: {reason}"),
            Self::Integration {
                connector_id,
                action,
                reason,
                retries,
            } => {
                write!(
                    f,
                    "integration {connector_id}.{action} failed after {retries} retries: {reason}"
                )
            }
            Self::Action {
                action_id,
                reason,
                retries,
            } => {
                write!(f, "action {action_id} failed after {retries} retries: {reason}")
            }
            Self::Condition(err) => write!(f, "condition: {err}"),
            Self::Transform(err) => write!(f, "transform: {err}"),
            Self::Branch { branch, reason } => write!(f, "branch '{branch}': {reason}"),
        }
    }
}

impl std::error::Error for NodeDispatchError {}

impl From<ConditionError> for NodeDispatchError {
    fn from(err: ConditionError) -> Self {
        Self::Condition(err)
    }
}

impl From<TransformError> for NodeDispatchError {
    fn from(err: TransformError) -> Self {
        Self::Transform(err)
    }
}

/// Why a workflow run ended in the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Node execution failed and error handling stopped the run.
    NodeFailed { node_id: NodeId, reason: String },
    /// The run exceeded the definition's timeout.
    Timeout { timeout_ms: u64 },
    /// No pending node could make progress.
    Stalled { pending: Vec<NodeId> },
    /// The definition failed validation at execution time.
    InvalidDefinition(GraphError),
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeFailed { node_id, reason } => {
                write!(f, "node {node_id} failed: {reason}")
            }
            Self::Timeout { timeout_ms } => {
                write!(f, "execution exceeded timeout of {timeout_ms}ms")
            }
            Self::Stalled { pending } => {
                let pending: Vec<String> = pending.iter().map(ToString::to_string).collect();
                write!(f, "execution stalled with pending nodes: {}", pending.join(", "))
            }
            Self::InvalidDefinition(err) => write!(f, "invalid definition: {err}"),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// High-level workflow errors returned by the store and engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Workflow not found.
    NotFound { workflow_id: WorkflowId },
    /// A workflow with this id is already registered.
    AlreadyExists { workflow_id: WorkflowId },
    /// The definition was rejected.
    InvalidDefinition {
        workflow_id: WorkflowId,
        source: GraphError,
    },
    /// Execution not found.
    ExecutionNotFound { execution_id: ExecutionId },
    /// The execution is not in a state that allows the request.
    ExecutionNotRunning {
        execution_id: ExecutionId,
        status: String,
    },
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::AlreadyExists { workflow_id } => {
                write!(f, "workflow already registered: {workflow_id}")
            }
            Self::InvalidDefinition {
                workflow_id,
                source,
            } => {
                write!(f, "workflow {workflow_id} is invalid: {source}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::ExecutionNotRunning {
                execution_id,
                status,
            } => {
                write!(f, "execution {execution_id} is {status}, not running")
            }
        }
    }
}

impl std::error::Error for WorkflowError {}
