//! Agent collaborator contract.
//!
//! Agent nodes hand their resolved input and the run's context to an
//! [`AgentExecutor`]. What an agent does is opaque to the engine.

use crate::context::WorkflowContext;
use crate::error::AgentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Outcome reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Error,
}

/// Response from an agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: JsonValue,
    pub status: AgentStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentResponse {
    /// A successful response.
    #[must_use]
    pub fn success(output: JsonValue) -> Self {
        Self {
            output,
            status: AgentStatus::Success,
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: JsonValue::Null,
            status: AgentStatus::Error,
            error: Some(message.into()),
        }
    }
}

/// Runs agents on behalf of workflow nodes.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Invokes `agent_id` with `input`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent does not exist or cannot be reached. A
    /// reachable agent that fails reports it through [`AgentStatus::Error`].
    async fn execute_agent(
        &self,
        agent_id: &str,
        input: JsonValue,
        context: &WorkflowContext,
    ) -> Result<AgentResponse, AgentError>;
}
