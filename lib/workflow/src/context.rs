//! Per-execution context.
//!
//! Every run owns exactly one [`WorkflowContext`]. It carries the ids the
//! run was started with and a variable bag that node templates and
//! connection conditions read from. Callers never build one directly; they
//! pass [`ContextOverrides`] and the engine creates the context.

use copper_relay_core::{ExecutionId, SessionId, UserId, WorkflowId, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Caller-supplied parts of a run's context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextOverrides {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
}

impl ContextOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace_id: WorkspaceId) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(key.into(), value);
        self
    }
}

/// Scope of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    /// The actor the run acts on behalf of.
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Variable bag.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
}

impl WorkflowContext {
    /// Creates an empty context for a run.
    #[must_use]
    pub fn new(execution_id: ExecutionId, workflow_id: WorkflowId) -> Self {
        Self {
            execution_id,
            workflow_id,
            user_id: None,
            workspace_id: None,
            session_id: None,
            variables: Map::new(),
        }
    }

    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.set_variable(key, value);
        self
    }

    /// Sets a variable, replacing any previous value.
    pub fn set_variable(&mut self, key: impl Into<String>, value: JsonValue) {
        self.variables.insert(key.into(), value);
    }

    /// Returns a variable.
    #[must_use]
    pub fn variable(&self, key: &str) -> Option<&JsonValue> {
        self.variables.get(key)
    }

    /// Takes the ids and variables of `overrides`. Variables replace
    /// existing ones with the same key.
    pub fn apply(&mut self, overrides: ContextOverrides) {
        self.user_id = overrides.user_id.or(self.user_id);
        self.workspace_id = overrides.workspace_id.or(self.workspace_id);
        self.session_id = overrides.session_id.or(self.session_id);
        self.variables.extend(overrides.variables);
    }

    /// Returns the variables overlaid with the fields of `value` (when it is
    /// an object) plus `value` itself under `key`.
    #[must_use]
    pub fn scope_with(&self, value: &JsonValue, key: &str) -> JsonValue {
        let mut scope = self.variables.clone();
        if let JsonValue::Object(fields) = value {
            scope.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        scope.insert(key.to_string(), value.clone());
        JsonValue::Object(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> WorkflowContext {
        WorkflowContext::new(ExecutionId::new(), WorkflowId::new())
    }

    #[test]
    fn scope_with_overlays_value_fields() {
        let ctx = context()
            .with_variable("region", json!("eu"))
            .with_variable("score", json!(1));

        let scope = ctx.scope_with(&json!({"score": 80}), "output");
        assert_eq!(scope["region"], "eu");
        assert_eq!(scope["score"], 80);
        assert_eq!(scope["output"], json!({"score": 80}));
    }

    #[test]
    fn scope_with_scalar_only_sets_key() {
        let scope = context().scope_with(&json!("hi"), "input");
        assert_eq!(scope, json!({"input": "hi"}));
    }

    #[test]
    fn apply_overrides_ids_and_variables() {
        let user = UserId::new();
        let workspace = WorkspaceId::new();
        let mut ctx = context().with_variable("a", json!(1)).with_variable("keep", json!(true));

        ctx.apply(
            ContextOverrides::new()
                .with_user(user)
                .with_workspace(workspace)
                .with_variable("a", json!(2)),
        );

        assert_eq!(ctx.user_id, Some(user));
        assert_eq!(ctx.workspace_id, Some(workspace));
        assert_eq!(ctx.session_id, None);
        assert_eq!(ctx.variable("a"), Some(&json!(2)));
        assert_eq!(ctx.variable("keep"), Some(&json!(true)));
    }

    #[test]
    fn overrides_deserialize_with_defaults() {
        let overrides: ContextOverrides =
            serde_json::from_value(json!({"variables": {"tenant": "acme"}})).expect("deserialize");
        assert_eq!(overrides.variables["tenant"], "acme");
        assert!(overrides.user_id.is_none());
    }
}
