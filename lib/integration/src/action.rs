//! Leaf-level action execution.
//!
//! An [`ActionDefinition`] names a side-effecting operation (an HTTP call,
//! an email, a database write, ...) by type and carries a free-form config.
//! The [`ActionExecutor`] substitutes `${...}` placeholders in that config,
//! hands it to the [`ActionHandler`] registered for the action's type and
//! retries failures according to the action's [`RetryPolicy`].
//!
//! Execution never returns an error: exhausted retries and missing handlers
//! are reported through [`ActionResult`] so the caller can apply its own
//! failure policy on top.

use crate::error::ActionError;
use crate::retry::RetryPolicy;
use crate::substitution::substitute;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// The kind of side effect an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Outbound HTTP request.
    Http,
    /// Email delivery.
    Email,
    /// Outbound webhook call.
    Webhook,
    /// Database operation.
    Database,
    /// File operation.
    File,
    /// User-facing notification.
    Notification,
    /// Deployment-specific action.
    Custom,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Database => "database",
            Self::File => "file",
            Self::Notification => "notification",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// A declared action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Identifier used in logs and results.
    pub id: String,
    /// Kind of action, selects the handler.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Handler-specific configuration; may contain `${...}` placeholders.
    #[serde(default)]
    pub config: JsonValue,
    /// Retry policy applied to handler failures.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl ActionDefinition {
    /// Creates an action with no retries.
    #[must_use]
    pub fn new(id: impl Into<String>, action_type: ActionType, config: JsonValue) -> Self {
        Self {
            id: id.into(),
            action_type,
            config,
            retry_policy: RetryPolicy::none(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// Outcome of executing an action, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the final attempt succeeded.
    pub success: bool,
    /// Handler output on success.
    pub data: Option<JsonValue>,
    /// Final error message on failure.
    pub error: Option<String>,
    /// Wall time across all attempts, including backoff.
    pub execution_time_ms: u64,
    /// Retries performed after the initial attempt.
    pub retry_count: u32,
}

/// Performs the side effect for one action type.
///
/// Handlers receive the already-substituted config.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Executes the action once.
    ///
    /// # Errors
    ///
    /// Returns an error if the side effect could not be performed.
    async fn handle(&self, config: &JsonValue) -> Result<JsonValue, ActionError>;
}

/// Dispatches actions to per-type handlers with retry and backoff.
#[derive(Clone, Default)]
pub struct ActionExecutor {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionExecutor {
    /// Creates an executor with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for an action type, replacing any previous one.
    #[must_use]
    pub fn with_handler(mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) -> Self {
        self.register_handler(action_type, handler);
        self
    }

    /// Registers the handler for an action type, replacing any previous one.
    pub fn register_handler(&mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type, handler);
    }

    /// Returns whether a handler is registered for `action_type`.
    #[must_use]
    pub fn has_handler(&self, action_type: ActionType) -> bool {
        self.handlers.contains_key(&action_type)
    }

    /// Executes `action` with placeholders resolved against `scope`.
    #[instrument(skip(self, action, scope), fields(action_id = %action.id, action_type = %action.action_type))]
    pub async fn execute_action(&self, action: &ActionDefinition, scope: &JsonValue) -> ActionResult {
        let started = Instant::now();
        let config = substitute(&action.config, scope);

        let Some(handler) = self.handlers.get(&action.action_type) else {
            let err = ActionError::HandlerMissing {
                action_type: action.action_type,
            };
            warn!(error = %err, "action has no handler");
            return ActionResult {
                success: false,
                data: None,
                error: Some(err.to_string()),
                execution_time_ms: elapsed_ms(started),
                retry_count: 0,
            };
        };

        let outcome = action
            .retry_policy
            .run(|_attempt| handler.handle(&config), ActionError::is_retryable)
            .await;

        let execution_time_ms = elapsed_ms(started);
        match outcome.result {
            Ok(data) => {
                debug!(retries = outcome.retries, execution_time_ms, "action succeeded");
                ActionResult {
                    success: true,
                    data: Some(data),
                    error: None,
                    execution_time_ms,
                    retry_count: outcome.retries,
                }
            }
            Err(err) => {
                warn!(retries = outcome.retries, error = %err, "action failed");
                ActionResult {
                    success: false,
                    data: None,
                    error: Some(err.to_string()),
                    execution_time_ms,
                    retry_count: outcome.retries,
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
