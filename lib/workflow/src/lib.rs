//! Workflow engine for copper-relay.
//!
//! This crate provides the workflow model and the engine that runs it:
//!
//! - **Definitions**: nodes, connections and run settings, validated into a
//!   petgraph [`WorkflowGraph`] before anything executes
//! - **Evaluators**: a restricted expression language, structured
//!   conditions and declarative transforms
//! - **Dispatch**: per-node-type execution against the agent and
//!   integration collaborators
//! - **Engine**: wave-based execution with error handling modes, timeouts,
//!   stop requests and execution events
//! - **Store**: definitions and execution history behind a repository trait

pub mod agent;
pub mod condition;
pub mod config;
pub mod context;
pub mod definition;
pub mod dispatch;
pub mod edge;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod expression;
pub mod graph;
pub mod node;
pub mod store;
pub mod transform;

pub use agent::{AgentExecutor, AgentResponse, AgentStatus};
pub use condition::{
    ComparisonOperator, Condition, ExistenceOperator, LogicalOperator, PatternOperator,
};
pub use config::EngineConfig;
pub use context::{ContextOverrides, WorkflowContext};
pub use definition::{ErrorHandling, WorkflowDefinition, WorkflowSettings, WorkflowSummary};
pub use dispatch::NodeDispatcher;
pub use edge::{FALSE_PORT, TRUE_PORT, WorkflowConnection};
pub use engine::WorkflowEngine;
pub use error::{
    AgentError, ConditionError, ExecutionError, ExpressionError, GraphError, NodeDispatchError,
    TransformError, WorkflowError,
};
pub use events::{EventBus, ExecutionEvent};
pub use execution::{
    ExecutionStatus, ExecutionTrace, StepStatus, WorkflowExecution, WorkflowExecutionStep,
};
pub use expression::Expression;
pub use graph::WorkflowGraph;
pub use node::{
    IntegrationNodeConfig, NodeConfig, NodeId, NodeType, ParallelBranch, Position, WorkflowNode,
};
pub use store::{InMemoryRepository, Repository, WorkflowStore};
pub use transform::{FieldMapping, TransformConfig, TransformOperation};
