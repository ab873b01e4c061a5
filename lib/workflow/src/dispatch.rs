//! Node dispatch.
//!
//! [`NodeDispatcher`] turns one node plus its input into an output. It knows
//! nothing about graphs or waves; the engine decides what to dispatch and
//! when.
//!
//! Inside a node the template scope is the run's variables overlaid with
//! the fields of the node input, plus the node input itself under `input`.

use crate::agent::{AgentExecutor, AgentStatus};
use crate::context::WorkflowContext;
use crate::error::NodeDispatchError;
use crate::node::{IntegrationNodeConfig, NodeConfig, ParallelBranch, WorkflowNode};
use copper_relay_integration::{
    ActionExecutor, ConnectorError, IntegrationExecutor, RetryPolicy, substitute,
};
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Dispatches nodes to the collaborator or evaluator that handles their type.
#[derive(Clone, Default)]
pub struct NodeDispatcher {
    agents: Option<Arc<dyn AgentExecutor>>,
    integrations: Option<Arc<dyn IntegrationExecutor>>,
    actions: Arc<ActionExecutor>,
}

impl NodeDispatcher {
    /// Creates a dispatcher with no collaborators and no action handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_agents(mut self, agents: Arc<dyn AgentExecutor>) -> Self {
        self.agents = Some(agents);
        self
    }

    #[must_use]
    pub fn with_integrations(mut self, integrations: Arc<dyn IntegrationExecutor>) -> Self {
        self.integrations = Some(integrations);
        self
    }

    #[must_use]
    pub fn with_actions(mut self, actions: Arc<ActionExecutor>) -> Self {
        self.actions = actions;
        self
    }

    /// Dispatches `node` with `input`. The returned future owns everything it
    /// needs, so it can be spawned.
    pub fn dispatch(
        &self,
        node: WorkflowNode,
        input: JsonValue,
        context: Arc<WorkflowContext>,
    ) -> BoxFuture<'static, Result<JsonValue, NodeDispatchError>> {
        let dispatcher = self.clone();
        async move { dispatcher.run(&node, input, &context).await }.boxed()
    }

    async fn run(
        &self,
        node: &WorkflowNode,
        input: JsonValue,
        context: &Arc<WorkflowContext>,
    ) -> Result<JsonValue, NodeDispatchError> {
        debug!(node_id = %node.id, node_type = %node.node_type(), "dispatching node");
        let scope = context.scope_with(&input, "input");

        match &node.config {
            NodeConfig::Trigger | NodeConfig::Start | NodeConfig::End => Ok(input),
            NodeConfig::Agent {
                agent_id,
                input: template,
            } => {
                let agents = self
                    .agents
                    .as_ref()
                    .ok_or(NodeDispatchError::CollaboratorMissing { collaborator: "agent" })?;
                let agent_input = template
                    .as_ref()
                    .map_or(input, |template| substitute(template, &scope));
                let failed = |reason: String| NodeDispatchError::Agent {
                    agent_id: agent_id.clone(),
                    reason,
                };

                let response = agents
                    .execute_agent(agent_id, agent_input, context)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
                match response.status {
                    AgentStatus::Success => Ok(response.output),
                    AgentStatus::Error => Err(failed(
                        response
                            .error
                            .unwrap_or_else(|| "agent reported an error".to_string()),
                    )),
                }
            }
            NodeConfig::Integration(IntegrationNodeConfig::Connector {
                connector_id,
                action,
                parameters,
                retry_policy,
            }) => {
                let integrations = self.integrations.as_ref().ok_or(
                    NodeDispatchError::CollaboratorMissing {
                        collaborator: "integration",
                    },
                )?;
                let parameters = parameters
                    .as_ref()
                    .map_or(input, |parameters| substitute(parameters, &scope));
                call_integration(integrations, connector_id, action, parameters, retry_policy).await
            }
            NodeConfig::Integration(IntegrationNodeConfig::Action { action }) => {
                let result = self.actions.execute_action(action, &scope).await;
                if result.success {
                    Ok(result.data.unwrap_or(JsonValue::Null))
                } else {
                    Err(NodeDispatchError::Action {
                        action_id: action.id.clone(),
                        reason: result.error.unwrap_or_default(),
                        retries: result.retry_count,
                    })
                }
            }
            NodeConfig::Transform(transform) => Ok(transform.apply(&input, &scope)?),
            NodeConfig::Condition { condition } => {
                let result = condition.evaluate(&scope)?;
                Ok(json!({ "result": result, "value": input }))
            }
            NodeConfig::Delay { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                Ok(input)
            }
            NodeConfig::Parallel { branches } => {
                let runs = branches
                    .iter()
                    .map(|branch| self.run_branch(branch, input.clone(), context));
                Ok(JsonValue::Array(try_join_all(runs).await?))
            }
        }
    }

    /// Runs a branch's nodes in order, feeding each the previous output.
    async fn run_branch(
        &self,
        branch: &ParallelBranch,
        input: JsonValue,
        context: &Arc<WorkflowContext>,
    ) -> Result<JsonValue, NodeDispatchError> {
        let mut value = input;
        for node in &branch.nodes {
            value = self
                .dispatch(node.clone(), value, Arc::clone(context))
                .await
                .map_err(|e| NodeDispatchError::Branch {
                    branch: branch.name.clone(),
                    reason: format!("node {}: {e}", node.id),
                })?;
        }
        Ok(value)
    }
}

async fn call_integration(
    integrations: &Arc<dyn IntegrationExecutor>,
    connector_id: &str,
    action: &str,
    parameters: JsonValue,
    retry_policy: &RetryPolicy,
) -> Result<JsonValue, NodeDispatchError> {
    let outcome = retry_policy
        .run(
            |_| integrations.execute_action(connector_id, action, parameters.clone()),
            ConnectorError::is_retryable,
        )
        .await;

    outcome
        .result
        .map_err(|e| NodeDispatchError::Integration {
            connector_id: connector_id.to_string(),
            action: action.to_string(),
            reason: e.to_string(),
            retries: outcome.retries,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentResponse;
    use crate::condition::{ComparisonOperator, Condition};
    use crate::error::AgentError;
    use crate::transform::{TransformConfig, TransformOperation};
    use async_trait::async_trait;
    use copper_relay_core::{ExecutionId, WorkflowId};
    use copper_relay_integration::{
        ActionDefinition, ActionError, ActionHandler, ActionType, BackoffStrategy,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ShoutAgent;

    #[async_trait]
    impl AgentExecutor for ShoutAgent {
        async fn execute_agent(
            &self,
            agent_id: &str,
            input: JsonValue,
            _context: &WorkflowContext,
        ) -> Result<AgentResponse, AgentError> {
            match agent_id {
                "shout" => Ok(AgentResponse::success(json!({
                    "reply": input["text"].as_str().unwrap_or_default().to_uppercase()
                }))),
                "sulk" => Ok(AgentResponse::error("not today")),
                other => Err(AgentError::NotFound {
                    agent_id: other.to_string(),
                }),
            }
        }
    }

    /// Fails with a transient error until `failures` calls have been made.
    struct FlakyIntegration {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl IntegrationExecutor for FlakyIntegration {
        async fn execute_action(
            &self,
            connector_id: &str,
            action_name: &str,
            input: JsonValue,
        ) -> Result<JsonValue, ConnectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ConnectorError::ConnectionFailed {
                    reason: "reset by peer".to_string(),
                });
            }
            Ok(json!({"connector": connector_id, "action": action_name, "input": input}))
        }
    }

    struct Recorder;

    #[async_trait]
    impl ActionHandler for Recorder {
        async fn handle(&self, config: &JsonValue) -> Result<JsonValue, ActionError> {
            Ok(json!({"sent": config}))
        }
    }

    fn context() -> Arc<WorkflowContext> {
        Arc::new(
            WorkflowContext::new(ExecutionId::new(), WorkflowId::new())
                .with_variable("channel", json!("#ops")),
        )
    }

    fn node(config: NodeConfig) -> WorkflowNode {
        WorkflowNode::new("n", config)
    }

    #[tokio::test]
    async fn passthrough_nodes_return_input() {
        let dispatcher = NodeDispatcher::new();
        for config in [NodeConfig::Start, NodeConfig::End, NodeConfig::Trigger] {
            let output = dispatcher
                .dispatch(node(config), json!({"a": 1}), context())
                .await
                .expect("passes through");
            assert_eq!(output, json!({"a": 1}));
        }
    }

    #[tokio::test]
    async fn agent_receives_templated_input() {
        let dispatcher = NodeDispatcher::new().with_agents(Arc::new(ShoutAgent));
        let config = NodeConfig::Agent {
            agent_id: "shout".to_string(),
            input: Some(json!({"text": "${greeting} from ${channel}"})),
        };

        let output = dispatcher
            .dispatch(node(config), json!({"greeting": "hello"}), context())
            .await
            .expect("agent runs");
        assert_eq!(output, json!({"reply": "HELLO FROM #OPS"}));
    }

    #[tokio::test]
    async fn agent_error_status_fails_the_node() {
        let dispatcher = NodeDispatcher::new().with_agents(Arc::new(ShoutAgent));
        let config = NodeConfig::Agent {
            agent_id: "sulk".to_string(),
            input: None,
        };

        let err = dispatcher
            .dispatch(node(config), json!({}), context())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NodeDispatchError::Agent {
                agent_id: "sulk".to_string(),
                reason: "not today".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn missing_collaborator_is_reported() {
        let config = NodeConfig::Agent {
            agent_id: "shout".to_string(),
            input: None,
        };
        let err = NodeDispatcher::new()
            .dispatch(node(config), json!({}), context())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NodeDispatchError::CollaboratorMissing { collaborator: "agent" }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connector_calls_retry_transient_failures() {
        let integration = Arc::new(FlakyIntegration {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let dispatcher = NodeDispatcher::new().with_integrations(integration.clone());
        let config = NodeConfig::Integration(IntegrationNodeConfig::Connector {
            connector_id: "slack".to_string(),
            action: "post".to_string(),
            parameters: Some(json!({"channel": "${channel}", "text": "${input.body}"})),
            retry_policy: RetryPolicy::new(3, BackoffStrategy::Fixed, 50),
        });

        let output = dispatcher
            .dispatch(node(config), json!({"body": "deployed"}), context())
            .await
            .expect("succeeds on third call");

        assert_eq!(integration.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            output["input"],
            json!({"channel": "#ops", "text": "deployed"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connector_failure_reports_retries() {
        let integration = Arc::new(FlakyIntegration {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let dispatcher = NodeDispatcher::new().with_integrations(integration);
        let config = NodeConfig::Integration(IntegrationNodeConfig::Connector {
            connector_id: "crm".to_string(),
            action: "sync".to_string(),
            parameters: None,
            retry_policy: RetryPolicy::new(1, BackoffStrategy::Fixed, 10),
        });

        let err = dispatcher
            .dispatch(node(config), json!({}), context())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeDispatchError::Integration { retries: 1, .. }
        ));
    }

    #[tokio::test]
    async fn action_node_runs_through_action_executor() {
        let actions = ActionExecutor::new().with_handler(ActionType::Email, Arc::new(Recorder));
        let dispatcher = NodeDispatcher::new().with_actions(Arc::new(actions));
        let action = ActionDefinition::new("welcome", ActionType::Email, json!({"to": "${email}"}));
        let config = NodeConfig::Integration(IntegrationNodeConfig::Action { action });

        let output = dispatcher
            .dispatch(node(config), json!({"email": "ada@example.com"}), context())
            .await
            .expect("action runs");
        assert_eq!(output, json!({"sent": {"to": "ada@example.com"}}));
    }

    #[tokio::test]
    async fn action_without_handler_fails_the_node() {
        let action = ActionDefinition::new("page", ActionType::Notification, json!({}));
        let config = NodeConfig::Integration(IntegrationNodeConfig::Action { action });

        let err = NodeDispatcher::new()
            .dispatch(node(config), json!({}), context())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeDispatchError::Action { retries: 0, .. }
        ));
    }

    #[tokio::test]
    async fn condition_outputs_result_and_value() {
        let config = NodeConfig::Condition {
            condition: Condition::compare("$score", ComparisonOperator::Gt, 70),
        };
        let output = NodeDispatcher::new()
            .dispatch(node(config), json!({"score": 80}), context())
            .await
            .expect("evaluates");
        assert_eq!(output, json!({"result": true, "value": {"score": 80}}));
    }

    #[tokio::test]
    async fn transform_applies_to_input() {
        let config = NodeConfig::Transform(TransformConfig::Apply {
            operation: TransformOperation::Uppercase,
            fields: None,
        });
        let output = NodeDispatcher::new()
            .dispatch(node(config), json!({"text": "hi"}), context())
            .await
            .expect("transforms");
        assert_eq!(output, json!({"text": "HI"}));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_then_passes_input() {
        let start = tokio::time::Instant::now();
        let output = NodeDispatcher::new()
            .dispatch(node(NodeConfig::Delay { duration_ms: 250 }), json!(7), context())
            .await
            .expect("delays");
        assert_eq!(output, json!(7));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn parallel_collects_branch_outputs_in_order() {
        let upper = WorkflowNode::new(
            "upper",
            NodeConfig::Transform(TransformConfig::Apply {
                operation: TransformOperation::Uppercase,
                fields: None,
            }),
        );
        let trim = WorkflowNode::new(
            "trim",
            NodeConfig::Transform(TransformConfig::Apply {
                operation: TransformOperation::Trim,
                fields: None,
            }),
        );
        let config = NodeConfig::Parallel {
            branches: vec![
                ParallelBranch {
                    name: "loud".to_string(),
                    nodes: vec![upper.clone(), trim.clone()],
                },
                ParallelBranch {
                    name: "same".to_string(),
                    nodes: vec![WorkflowNode::new("pass", NodeConfig::Start)],
                },
            ],
        };

        let output = NodeDispatcher::new()
            .dispatch(node(config), json!({"text": " hi "}), context())
            .await
            .expect("branches run");
        assert_eq!(output, json!([{"text": "HI"}, {"text": " hi "}]));
    }

    #[tokio::test]
    async fn parallel_branch_failure_names_the_branch() {
        let config = NodeConfig::Parallel {
            branches: vec![ParallelBranch {
                name: "agents".to_string(),
                nodes: vec![WorkflowNode::new(
                    "ask",
                    NodeConfig::Agent {
                        agent_id: "any".to_string(),
                        input: None,
                    },
                )],
            }],
        };

        let err = NodeDispatcher::new()
            .dispatch(node(config), json!({}), context())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "branch 'agents': node ask: no agent collaborator configured"
        );
    }
}
