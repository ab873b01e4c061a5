//! Workflow engine.
//!
//! Executes a definition in dependency waves:
//!
//! 1. A node is ready once none of its incoming connections is undecided.
//! 2. Nodes whose incoming connections were all left untraversed are
//!    skipped, and their own outgoing connections are left untraversed too.
//! 3. Ready nodes are dispatched together, bounded by a semaphore; the next
//!    wave starts only after every node of the current one finished.
//! 4. Each finished node decides which of its outgoing connections are
//!    traversed (condition ports and connection conditions).
//!
//! The wave loop runs at most `node_count + 1` times. Steps are appended to
//! the trace in completion order and synced to the store after every wave,
//! which is also where a stop request is observed.

use crate::agent::AgentExecutor;
use crate::config::EngineConfig;
use crate::context::{ContextOverrides, WorkflowContext};
use crate::definition::{ErrorHandling, WorkflowDefinition, WorkflowSettings};
use crate::dispatch::NodeDispatcher;
use crate::error::{ExecutionError, NodeDispatchError, WorkflowError};
use crate::events::{EventBus, ExecutionEvent};
use crate::execution::{ExecutionStatus, ExecutionTrace, WorkflowExecution, WorkflowExecutionStep};
use crate::graph::WorkflowGraph;
use crate::node::{NodeId, NodeType, WorkflowNode};
use crate::store::WorkflowStore;
use chrono::Utc;
use copper_relay_core::{ExecutionId, WorkflowId};
use copper_relay_integration::{ActionExecutor, IntegrationExecutor, RetryPolicy};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rootcause::Report;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Runs workflow definitions and keeps their execution history.
#[derive(Clone)]
pub struct WorkflowEngine {
    store: WorkflowStore,
    dispatcher: NodeDispatcher,
    events: EventBus,
    config: EngineConfig,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl WorkflowEngine {
    /// Creates an engine with an in-memory store and no collaborators.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            store: WorkflowStore::in_memory(),
            dispatcher: NodeDispatcher::new(),
            events: EventBus::new(config.event_buffer),
            config,
        }
    }

    #[must_use]
    pub fn with_agents(mut self, agents: Arc<dyn AgentExecutor>) -> Self {
        self.dispatcher = self.dispatcher.with_agents(agents);
        self
    }

    #[must_use]
    pub fn with_integrations(mut self, integrations: Arc<dyn IntegrationExecutor>) -> Self {
        self.dispatcher = self.dispatcher.with_integrations(integrations);
        self
    }

    #[must_use]
    pub fn with_actions(mut self, actions: Arc<ActionExecutor>) -> Self {
        self.dispatcher = self.dispatcher.with_actions(actions);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: WorkflowStore) -> Self {
        self.store = store;
        self
    }

    /// The store holding definitions and executions.
    #[must_use]
    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribes to execution events of every run.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Validates and registers a definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is invalid or already registered.
    pub fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowId, Report<WorkflowError>> {
        let workflow_id = self.store.register_workflow(definition)?;
        info!(%workflow_id, "workflow registered");
        Ok(workflow_id)
    }

    /// Executes a registered workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow is not registered. Failures during
    /// the run are reported on the returned trace.
    pub async fn run_workflow(
        &self,
        workflow_id: WorkflowId,
        input: JsonValue,
        overrides: Option<ContextOverrides>,
    ) -> Result<ExecutionTrace, Report<WorkflowError>> {
        let definition = self.store.get_workflow(workflow_id)?;
        Ok(self.execute(&definition, input, overrides).await)
    }

    /// Executes `definition` with `input` and returns the final trace.
    ///
    /// A fresh context is created for the run and `overrides` are applied
    /// to it. The run input is stored as the context's `input` variable, but
    /// inside a node `input` names that node's own input; a later node reads
    /// earlier results through `steps.<node id>`.
    #[instrument(skip(self, definition, input, overrides), fields(workflow_id = %definition.id))]
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: JsonValue,
        overrides: Option<ContextOverrides>,
    ) -> ExecutionTrace {
        let execution_id = ExecutionId::new();
        let mut run_context = WorkflowContext::new(execution_id, definition.id);
        if let Some(overrides) = overrides {
            run_context.apply(overrides);
        }
        run_context.set_variable("input", input.clone());

        let mut trace = WorkflowExecution::new(execution_id, definition.id, input);
        trace.start();
        self.store.record_execution(trace.clone());
        self.events.publish(ExecutionEvent::RunStarted {
            execution_id,
            workflow_id: definition.id,
            timestamp: Utc::now(),
        });
        info!(%execution_id, name = %definition.name, "workflow run started");

        let graph = match definition.validate() {
            Ok(graph) => graph,
            Err(err) => {
                return self.finish(
                    trace,
                    Err(RunEnd::Failed(ExecutionError::InvalidDefinition(err))),
                );
            }
        };

        let mut run = Run::new(definition, graph, run_context, trace);
        let end = self.drive(&mut run).await;
        self.finish(run.trace, end)
    }

    /// Returns an execution record.
    ///
    /// # Errors
    ///
    /// Returns an error if no such execution exists.
    pub fn get_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<WorkflowExecution, Report<WorkflowError>> {
        self.store.get_execution(execution_id)
    }

    /// Lists executions, optionally for one workflow.
    #[must_use]
    pub fn list_executions(&self, workflow_id: Option<WorkflowId>) -> Vec<WorkflowExecution> {
        self.store.list_executions(workflow_id)
    }

    /// Requests that a running execution stop.
    ///
    /// The run notices before its next wave. Work already in flight is not
    /// aborted; its results are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution does not exist or is not running.
    pub fn stop_execution(&self, execution_id: ExecutionId) -> Result<(), Report<WorkflowError>> {
        let previous = self.store.update_execution(execution_id, |execution| {
            let status = execution.status;
            if status == ExecutionStatus::Running {
                execution.stop();
            }
            status
        })?;
        if previous != ExecutionStatus::Running {
            return Err(WorkflowError::ExecutionNotRunning {
                execution_id,
                status: previous.to_string(),
            }
            .into());
        }

        self.events.publish(ExecutionEvent::RunStopped {
            execution_id,
            timestamp: Utc::now(),
        });
        info!(%execution_id, "workflow run stopped");
        Ok(())
    }

    async fn drive(&self, run: &mut Run<'_>) -> Result<JsonValue, RunEnd> {
        let definition = run.definition;
        let settings = &definition.settings;
        let limit = settings
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let retry_policy = self.node_retry_policy(settings);
        let timeout_ms = settings.timeout_ms;
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut pending: Vec<NodeId> = run.graph.nodes().cloned().collect();

        for _ in 0..=run.graph.node_count() {
            if self.sync(&run.trace, &[]) {
                return Err(RunEnd::Stopped);
            }

            self.skip_unreachable(run, &mut pending);
            if pending.is_empty() {
                return Ok(run.final_output());
            }

            if let (Some(deadline), Some(timeout_ms)) = (deadline, timeout_ms)
                && Instant::now() >= deadline
            {
                return Err(RunEnd::Failed(ExecutionError::Timeout { timeout_ms }));
            }

            let ready: Vec<NodeId> = pending
                .iter()
                .filter(|node_id| run.is_ready(node_id))
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }
            pending.retain(|node_id| !ready.contains(node_id));

            let wave = Wave {
                semaphore: &semaphore,
                retry_policy: &retry_policy,
                deadline,
                timeout_ms: timeout_ms.unwrap_or_default(),
            };
            if let Some(failure) = self.run_wave(run, ready, wave).await? {
                return Err(RunEnd::Failed(failure));
            }
        }

        Err(RunEnd::Failed(ExecutionError::Stalled { pending }))
    }

    /// Policy for re-dispatching failed nodes. Only `retry` mode re-dispatches.
    fn node_retry_policy(&self, settings: &WorkflowSettings) -> RetryPolicy {
        match settings.error_handling {
            ErrorHandling::Retry => settings.retry_policy.clone().unwrap_or_else(|| RetryPolicy {
                max_retries: self.config.max_node_attempts.saturating_sub(1),
                ..RetryPolicy::default()
            }),
            ErrorHandling::Stop | ErrorHandling::Continue => RetryPolicy::none(),
        }
    }

    fn skip_unreachable(&self, run: &mut Run<'_>, pending: &mut Vec<NodeId>) {
        loop {
            let skipped: Vec<NodeId> = pending
                .iter()
                .filter(|node_id| run.is_unreachable(node_id))
                .cloned()
                .collect();
            if skipped.is_empty() {
                return;
            }
            pending.retain(|node_id| !skipped.contains(node_id));

            for node_id in skipped {
                debug!(%node_id, "node skipped, no incoming connection traversed");
                run.skip(&node_id);
                self.events.publish(ExecutionEvent::NodeSkipped {
                    execution_id: run.trace.id,
                    node_id,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Dispatches one wave and folds the results into the run.
    ///
    /// Returns the first node failure that stops the run.
    async fn run_wave(
        &self,
        run: &mut Run<'_>,
        ready: Vec<NodeId>,
        wave: Wave<'_>,
    ) -> Result<Option<ExecutionError>, RunEnd> {
        let snapshot = Arc::new(run.context.clone());
        let mut in_flight = FuturesUnordered::new();
        let mut running = Vec::with_capacity(ready.len());

        for node_id in ready {
            let Some(node) = run.nodes.get(&node_id) else {
                continue;
            };
            let input = run.input_for(&node_id);
            running.push(WorkflowExecutionStep::started(
                node_id.clone(),
                node.node_type(),
                1,
                input.clone(),
            ));
            let task = NodeTask {
                dispatcher: self.dispatcher.clone(),
                events: self.events.clone(),
                execution_id: run.trace.id,
                node: (*node).clone(),
                input,
                context: Arc::clone(&snapshot),
                retry_policy: wave.retry_policy.clone(),
                semaphore: Arc::clone(wave.semaphore),
            };
            let handle = tokio::spawn(task.run());
            in_flight.push(async move { (node_id, handle.await) });
        }
        self.sync(&run.trace, &running);

        let mut failure = None;
        loop {
            let next = match wave.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, in_flight.next())
                    .await
                    .map_err(|_| {
                        RunEnd::Failed(ExecutionError::Timeout {
                            timeout_ms: wave.timeout_ms,
                        })
                    })?,
                None => in_flight.next().await,
            };
            let Some((node_id, joined)) = next else {
                break;
            };

            let finished = joined.unwrap_or_else(|e| NodeRun {
                steps: Vec::new(),
                result: Err(format!("node task ended abnormally: {e}")),
            });
            run.trace.steps.extend(finished.steps);
            running.retain(|step| step.node_id != node_id);
            self.sync(&run.trace, &running);

            match finished.result {
                Ok(output) => run.complete(&node_id, output),
                Err(reason) => match run.definition.settings.error_handling {
                    ErrorHandling::Continue => {
                        warn!(%node_id, error = %reason, "node failed, continuing");
                        run.complete(&node_id, json!({ "error": reason }));
                    }
                    ErrorHandling::Stop | ErrorHandling::Retry => {
                        warn!(%node_id, error = %reason, "node failed");
                        failure.get_or_insert(ExecutionError::NodeFailed { node_id, reason });
                    }
                },
            }
        }

        Ok(failure)
    }

    /// Copies the run's finished steps, followed by the `running` steps of
    /// nodes still in flight, to the stored record. Returns true if the run
    /// was stopped in the meantime.
    fn sync(&self, trace: &WorkflowExecution, running: &[WorkflowExecutionStep]) -> bool {
        self.store
            .update_execution(trace.id, |stored| {
                if stored.status == ExecutionStatus::Stopped {
                    return true;
                }
                stored.steps.clone_from(&trace.steps);
                stored.steps.extend_from_slice(running);
                false
            })
            .unwrap_or(false)
    }

    fn finish(&self, mut trace: WorkflowExecution, end: Result<JsonValue, RunEnd>) -> ExecutionTrace {
        match end {
            Ok(output) => trace.complete(output),
            Err(RunEnd::Failed(err)) => trace.fail(err.to_string()),
            Err(RunEnd::Stopped) => {}
        }

        // A stop request wins over whatever the run produced afterwards.
        let stored = self.store.update_execution(trace.id, |stored| {
            if stored.status != ExecutionStatus::Stopped {
                stored.clone_from(&trace);
            }
            stored.clone()
        });
        let trace = stored.unwrap_or_else(|_| {
            self.store.record_execution(trace.clone());
            trace
        });

        let execution_id = trace.id;
        match trace.status {
            ExecutionStatus::Completed => {
                info!(%execution_id, steps = trace.steps.len(), duration_ms = ?trace.duration_ms, "workflow run completed");
                self.events.publish(ExecutionEvent::RunCompleted {
                    execution_id,
                    output: trace.output.clone().unwrap_or(JsonValue::Null),
                    timestamp: Utc::now(),
                });
            }
            ExecutionStatus::Failed => {
                let message = trace.error.clone().unwrap_or_default();
                error!(%execution_id, error = %message, "workflow run failed");
                self.events.publish(ExecutionEvent::RunFailed {
                    execution_id,
                    error: message,
                    timestamp: Utc::now(),
                });
            }
            ExecutionStatus::Stopped | ExecutionStatus::Pending | ExecutionStatus::Running => {}
        }
        trace
    }
}

/// How a run ended without completing.
enum RunEnd {
    Failed(ExecutionError),
    Stopped,
}

/// Decision state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Taken,
    NotTaken,
}

/// Per-wave dispatch limits.
struct Wave<'a> {
    semaphore: &'a Arc<Semaphore>,
    retry_policy: &'a RetryPolicy,
    deadline: Option<Instant>,
    timeout_ms: u64,
}

/// Mutable state of one run.
struct Run<'a> {
    definition: &'a WorkflowDefinition,
    graph: WorkflowGraph,
    nodes: HashMap<&'a NodeId, &'a WorkflowNode>,
    context: WorkflowContext,
    trace: WorkflowExecution,
    outputs: HashMap<NodeId, JsonValue>,
    edges: Vec<EdgeState>,
}

impl<'a> Run<'a> {
    fn new(
        definition: &'a WorkflowDefinition,
        graph: WorkflowGraph,
        context: WorkflowContext,
        trace: WorkflowExecution,
    ) -> Self {
        Self {
            definition,
            graph,
            nodes: definition.nodes.iter().map(|node| (&node.id, node)).collect(),
            context,
            trace,
            outputs: HashMap::new(),
            edges: vec![EdgeState::Pending; definition.connections.len()],
        }
    }

    fn is_ready(&self, node_id: &NodeId) -> bool {
        self.graph
            .incoming(node_id)
            .iter()
            .all(|&c| self.edges[c] != EdgeState::Pending)
    }

    fn is_unreachable(&self, node_id: &NodeId) -> bool {
        let incoming = self.graph.incoming(node_id);
        !incoming.is_empty() && incoming.iter().all(|&c| self.edges[c] == EdgeState::NotTaken)
    }

    /// Entry nodes get the run input, single-parent nodes their parent's
    /// output, joins an object of traversed parents' outputs.
    fn input_for(&self, node_id: &NodeId) -> JsonValue {
        let incoming = self.graph.incoming(node_id);
        let output_of = |c: usize| {
            let source = &self.definition.connections[c].source;
            (source, self.outputs.get(source).cloned().unwrap_or(JsonValue::Null))
        };
        match incoming.as_slice() {
            [] => self.trace.input.clone(),
            [only] => output_of(*only).1,
            many => {
                let joined: Map<String, JsonValue> = many
                    .iter()
                    .filter(|&&c| self.edges[c] == EdgeState::Taken)
                    .map(|&c| {
                        let (source, output) = output_of(c);
                        (source.to_string(), output)
                    })
                    .collect();
                JsonValue::Object(joined)
            }
        }
    }

    fn skip(&mut self, node_id: &NodeId) {
        let node_type = self
            .nodes
            .get(node_id)
            .map_or(NodeType::Start, |node| node.node_type());
        self.trace
            .steps
            .push(WorkflowExecutionStep::skipped(node_id.clone(), node_type));
        for c in self.graph.outgoing(node_id) {
            self.edges[c] = EdgeState::NotTaken;
        }
    }

    /// Records a node's output and decides its outgoing connections.
    fn complete(&mut self, node_id: &NodeId, output: JsonValue) {
        let verdict = self
            .nodes
            .get(node_id)
            .filter(|node| node.node_type() == NodeType::Condition)
            .and_then(|_| output.get("result"))
            .and_then(JsonValue::as_bool);

        let mut scope = self.context.scope_with(&output, "output");
        if let (JsonValue::Object(fields), Some(input)) = (&mut scope, self.context.variable("input")) {
            fields.insert("input".to_string(), input.clone());
        }

        for c in self.graph.outgoing(node_id) {
            let connection = &self.definition.connections[c];
            let port_open = verdict.is_none_or(|result| result != connection.is_false_branch());
            let taken = port_open
                && self
                    .graph
                    .condition(c)
                    .is_none_or(|condition| condition.evaluate_bool(&scope));
            self.edges[c] = if taken {
                EdgeState::Taken
            } else {
                EdgeState::NotTaken
            };
        }

        let steps = self
            .context
            .variables
            .entry("steps")
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if let JsonValue::Object(steps) = steps {
            steps.insert(node_id.to_string(), output.clone());
        }
        self.outputs.insert(node_id.clone(), output);
    }

    /// The sole terminal node's output, or an object of every terminal node
    /// that produced one.
    fn final_output(&self) -> JsonValue {
        let terminals = self.graph.terminal_nodes();
        match terminals.as_slice() {
            [only] => self.outputs.get(only).cloned().unwrap_or(JsonValue::Null),
            many => JsonValue::Object(
                many.iter()
                    .filter_map(|id| Some((id.to_string(), self.outputs.get(id)?.clone())))
                    .collect(),
            ),
        }
    }
}

/// Result of running one node, with every attempt's step.
struct NodeRun {
    steps: Vec<WorkflowExecutionStep>,
    result: Result<JsonValue, String>,
}

/// One node dispatch, owned so it can be spawned.
struct NodeTask {
    dispatcher: NodeDispatcher,
    events: EventBus,
    execution_id: ExecutionId,
    node: WorkflowNode,
    input: JsonValue,
    context: Arc<WorkflowContext>,
    retry_policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
}

impl NodeTask {
    async fn run(self) -> NodeRun {
        // The semaphore is never closed.
        let _permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        let steps = Mutex::new(Vec::new());
        let outcome = self
            .retry_policy
            .run(
                |retry| self.attempt(retry + 1, &steps),
                |_: &NodeDispatchError| true,
            )
            .await;

        NodeRun {
            steps: steps.into_inner().unwrap_or_else(PoisonError::into_inner),
            result: outcome.result.map_err(|e| e.to_string()),
        }
    }

    async fn attempt(
        &self,
        attempt: u32,
        steps: &Mutex<Vec<WorkflowExecutionStep>>,
    ) -> Result<JsonValue, NodeDispatchError> {
        let node_id = self.node.id.clone();
        self.events.publish(ExecutionEvent::NodeStarted {
            execution_id: self.execution_id,
            node_id: node_id.clone(),
            attempt,
            timestamp: Utc::now(),
        });
        let mut step = WorkflowExecutionStep::started(
            node_id.clone(),
            self.node.node_type(),
            attempt,
            self.input.clone(),
        );

        let result = self
            .dispatcher
            .dispatch(self.node.clone(), self.input.clone(), Arc::clone(&self.context))
            .await;

        match &result {
            Ok(output) => {
                step.complete(output.clone());
                self.events.publish(ExecutionEvent::NodeCompleted {
                    execution_id: self.execution_id,
                    node_id,
                    output: output.clone(),
                    timestamp: Utc::now(),
                });
            }
            Err(err) => {
                step.fail(err.to_string());
                self.events.publish(ExecutionEvent::NodeFailed {
                    execution_id: self.execution_id,
                    node_id,
                    attempt,
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
        steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentResponse;
    use crate::condition::{ComparisonOperator, Condition};
    use crate::edge::{FALSE_PORT, TRUE_PORT, WorkflowConnection};
    use crate::error::AgentError;
    use crate::execution::StepStatus;
    use crate::node::NodeConfig;
    use crate::transform::{FieldMapping, TransformConfig, TransformOperation};
    use async_trait::async_trait;
    use copper_relay_integration::BackoffStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until `failures` calls have been made, then echoes its input.
    struct FlakyAgent {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyAgent {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentExecutor for FlakyAgent {
        async fn execute_agent(
            &self,
            _agent_id: &str,
            input: JsonValue,
            _context: &WorkflowContext,
        ) -> Result<AgentResponse, AgentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(AgentError::Failed {
                    reason: "model overloaded".to_string(),
                });
            }
            Ok(AgentResponse::success(input))
        }
    }

    fn start(id: &str) -> WorkflowNode {
        WorkflowNode::new(id, NodeConfig::Start)
    }

    fn end(id: &str) -> WorkflowNode {
        WorkflowNode::new(id, NodeConfig::End)
    }

    fn uppercase(id: &str) -> WorkflowNode {
        WorkflowNode::new(
            id,
            NodeConfig::Transform(TransformConfig::Apply {
                operation: TransformOperation::Uppercase,
                fields: None,
            }),
        )
    }

    fn delay(id: &str, duration_ms: u64) -> WorkflowNode {
        WorkflowNode::new(id, NodeConfig::Delay { duration_ms })
    }

    fn agent(id: &str) -> WorkflowNode {
        WorkflowNode::new(
            id,
            NodeConfig::Agent {
                agent_id: "helper".to_string(),
                input: None,
            },
        )
    }

    fn connect(source: &str, target: &str) -> WorkflowConnection {
        WorkflowConnection::new(format!("{source}->{target}"), source, target)
    }

    fn statuses(trace: &ExecutionTrace) -> HashMap<String, StepStatus> {
        trace
            .steps
            .iter()
            .map(|step| (step.node_id.to_string(), step.status))
            .collect()
    }

    #[tokio::test]
    async fn linear_run_transforms_input() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("shout")
            .with_node(start("start"))
            .with_node(uppercase("shout"))
            .with_node(end("end"))
            .with_connection(connect("start", "shout"))
            .with_connection(connect("shout", "end"));

        let trace = engine.execute(&definition, json!({"text": "hi"}), None).await;

        assert_eq!(trace.status, ExecutionStatus::Completed);
        assert_eq!(trace.output, Some(json!({"text": "HI"})));
        let order: Vec<&str> = trace.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(order, vec!["start", "shout", "end"]);
        assert_eq!(engine.get_execution(trace.id).expect("stored"), trace);
    }

    #[tokio::test]
    async fn condition_node_routes_by_port() {
        let engine = WorkflowEngine::default();
        let check = WorkflowNode::new(
            "check",
            NodeConfig::Condition {
                condition: Condition::compare("$score", ComparisonOperator::Gt, 70),
            },
        );
        let definition = WorkflowDefinition::new("route")
            .with_node(check)
            .with_node(end("high"))
            .with_node(end("low"))
            .with_node(end("after_low"))
            .with_connection(connect("check", "high").from_port(TRUE_PORT))
            .with_connection(connect("check", "low").from_port(FALSE_PORT))
            .with_connection(connect("low", "after_low"));

        let trace = engine.execute(&definition, json!({"score": 80}), None).await;

        assert_eq!(trace.status, ExecutionStatus::Completed);
        let statuses = statuses(&trace);
        assert_eq!(statuses["high"], StepStatus::Completed);
        assert_eq!(statuses["low"], StepStatus::Skipped);
        assert_eq!(statuses["after_low"], StepStatus::Skipped);
        assert_eq!(
            trace.output,
            Some(json!({"high": {"result": true, "value": {"score": 80}}}))
        );
    }

    #[tokio::test]
    async fn connection_condition_gates_traversal() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("gate")
            .with_node(start("start"))
            .with_node(end("notify"))
            .with_connection(connect("start", "notify").when("score > 70"));

        let low = engine.execute(&definition, json!({"score": 50}), None).await;
        assert_eq!(statuses(&low)["notify"], StepStatus::Skipped);
        assert_eq!(low.output, Some(JsonValue::Null));

        let high = engine.execute(&definition, json!({"score": 90}), None).await;
        assert_eq!(statuses(&high)["notify"], StepStatus::Completed);
        assert_eq!(high.output, Some(json!({"score": 90})));
    }

    #[tokio::test]
    async fn marked_paths_work_in_connection_conditions() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("marked gate")
            .with_node(start("start"))
            .with_node(end("notify"))
            .with_connection(connect("start", "notify").when("$score > 70"));
        engine
            .register_workflow(definition.clone())
            .expect("registers");

        let high = engine.execute(&definition, json!({"score": 90}), None).await;
        assert_eq!(statuses(&high)["notify"], StepStatus::Completed);

        let low = engine.execute(&definition, json!({"score": 10}), None).await;
        assert_eq!(statuses(&low)["notify"], StepStatus::Skipped);
    }

    #[tokio::test]
    async fn join_receives_outputs_keyed_by_source() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("fan")
            .with_node(start("start"))
            .with_node(uppercase("loud"))
            .with_node(start("plain"))
            .with_node(end("join"))
            .with_connection(connect("start", "loud"))
            .with_connection(connect("start", "plain"))
            .with_connection(connect("loud", "join"))
            .with_connection(connect("plain", "join"));

        let trace = engine.execute(&definition, json!({"text": "hi"}), None).await;

        assert_eq!(
            trace.output,
            Some(json!({"loud": {"text": "HI"}, "plain": {"text": "hi"}}))
        );
    }

    #[tokio::test]
    async fn step_outputs_are_visible_to_later_nodes() {
        let engine = WorkflowEngine::default();
        let copy = WorkflowNode::new(
            "copy",
            NodeConfig::Transform(TransformConfig::Map {
                mappings: vec![
                    FieldMapping::new("copied", "steps.first.text"),
                    FieldMapping::new("original", "input.text"),
                ],
                keep_unmapped: false,
            }),
        );
        let definition = WorkflowDefinition::new("steps")
            .with_node(uppercase("first"))
            .with_node(copy)
            .with_connection(connect("first", "copy"));

        let trace = engine.execute(&definition, json!({"text": "hi"}), None).await;

        assert_eq!(trace.output, Some(json!({"copied": "HI", "original": "HI"})));
    }

    #[tokio::test]
    async fn stop_mode_fails_run_at_first_failure() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("no agents")
            .with_node(start("start"))
            .with_node(agent("ask"))
            .with_node(end("end"))
            .with_connection(connect("start", "ask"))
            .with_connection(connect("ask", "end"));

        let trace = engine.execute(&definition, json!({}), None).await;

        assert_eq!(trace.status, ExecutionStatus::Failed);
        let error = trace.error.as_deref().unwrap_or_default();
        assert!(error.contains("node ask failed"), "{error}");
        assert!(!statuses(&trace).contains_key("end"));
    }

    #[tokio::test]
    async fn continue_mode_passes_error_downstream() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("tolerant")
            .with_node(agent("ask"))
            .with_node(end("end"))
            .with_connection(connect("ask", "end"))
            .with_settings(WorkflowSettings {
                error_handling: ErrorHandling::Continue,
                ..WorkflowSettings::default()
            });

        let trace = engine.execute(&definition, json!({}), None).await;

        assert_eq!(trace.status, ExecutionStatus::Completed);
        assert_eq!(statuses(&trace)["ask"], StepStatus::Failed);
        assert_eq!(
            trace.output,
            Some(json!({"error": "no agent collaborator configured"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_mode_redispatches_failed_node() {
        let engine = WorkflowEngine::default().with_agents(FlakyAgent::new(2));
        let definition = WorkflowDefinition::new("retry")
            .with_node(agent("ask"))
            .with_settings(WorkflowSettings {
                error_handling: ErrorHandling::Retry,
                retry_policy: Some(RetryPolicy::new(2, BackoffStrategy::Fixed, 10)),
                ..WorkflowSettings::default()
            });

        let trace = engine.execute(&definition, json!({"q": 1}), None).await;

        assert_eq!(trace.status, ExecutionStatus::Completed);
        let attempts: Vec<(u32, StepStatus)> = trace
            .steps_for(&NodeId::new("ask"))
            .map(|step| (step.attempt, step.status))
            .collect();
        assert_eq!(
            attempts,
            vec![
                (1, StepStatus::Failed),
                (2, StepStatus::Failed),
                (3, StepStatus::Completed)
            ]
        );
        assert_eq!(trace.output, Some(json!({"q": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_mode_gives_up_after_configured_attempts() {
        let engine = WorkflowEngine::default().with_agents(FlakyAgent::new(u32::MAX));
        let definition = WorkflowDefinition::new("hopeless")
            .with_node(agent("ask"))
            .with_settings(WorkflowSettings {
                error_handling: ErrorHandling::Retry,
                ..WorkflowSettings::default()
            });

        let trace = engine.execute(&definition, json!({}), None).await;

        assert_eq!(trace.status, ExecutionStatus::Failed);
        assert_eq!(trace.steps_for(&NodeId::new("ask")).count(), 3);
        assert!(trace.steps.iter().all(|s| s.status == StepStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_run() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("slow")
            .with_node(start("start"))
            .with_node(delay("wait", 1_000))
            .with_connection(connect("start", "wait"))
            .with_settings(WorkflowSettings {
                timeout_ms: Some(100),
                ..WorkflowSettings::default()
            });

        let trace = engine.execute(&definition, json!({}), None).await;

        assert_eq!(trace.status, ExecutionStatus::Failed);
        assert_eq!(
            trace.error.as_deref(),
            Some("execution exceeded timeout of 100ms")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn max_concurrency_bounds_a_wave() {
        let definition = |max_concurrency| {
            WorkflowDefinition::new("pair")
                .with_node(start("start"))
                .with_node(delay("a", 100))
                .with_node(delay("b", 100))
                .with_connection(connect("start", "a"))
                .with_connection(connect("start", "b"))
                .with_settings(WorkflowSettings {
                    max_concurrency,
                    ..WorkflowSettings::default()
                })
        };
        let engine = WorkflowEngine::default();

        let begin = Instant::now();
        engine.execute(&definition(None), json!({}), None).await;
        assert!(begin.elapsed() < Duration::from_millis(200));

        let begin = Instant::now();
        let trace = engine.execute(&definition(Some(1)), json!({}), None).await;
        assert!(begin.elapsed() >= Duration::from_millis(200));
        assert_eq!(trace.status, ExecutionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_later_results() {
        let engine = Arc::new(WorkflowEngine::default());
        let definition = WorkflowDefinition::new("stoppable")
            .with_node(delay("wait", 1_000))
            .with_node(end("end"))
            .with_connection(connect("wait", "end"));
        let mut events = engine.subscribe();

        let handle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.execute(&definition, json!({}), None).await }
        });

        let execution_id = loop {
            if let ExecutionEvent::NodeStarted { execution_id, .. } =
                events.recv().await.expect("event")
            {
                break execution_id;
            }
        };
        engine.stop_execution(execution_id).expect("stops");

        let trace = handle.await.expect("run finishes");
        assert_eq!(trace.status, ExecutionStatus::Stopped);
        assert!(trace.steps.iter().all(|s| s.node_id.as_str() != "end"));

        let err = engine.stop_execution(execution_id).unwrap_err();
        assert!(err.to_string().contains("is stopped, not running"));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_nodes_show_as_running() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("slow")
            .with_node(start("start"))
            .with_node(delay("wait", 1_000))
            .with_connection(connect("start", "wait"));

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.execute(&definition, json!({}), None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let executions = engine.list_executions(None);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Running);
        let during = statuses(&executions[0]);
        assert_eq!(during["start"], StepStatus::Completed);
        assert_eq!(during["wait"], StepStatus::Running);

        let trace = handle.await.expect("run finishes");
        assert_eq!(trace.steps.len(), 2);
        assert_eq!(statuses(&trace)["wait"], StepStatus::Completed);
    }

    #[tokio::test]
    async fn invalid_definition_fails_the_trace() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("loop")
            .with_node(start("a"))
            .with_node(start("b"))
            .with_connection(connect("a", "b"))
            .with_connection(connect("b", "a"));

        let trace = engine.execute(&definition, json!({}), None).await;

        assert_eq!(trace.status, ExecutionStatus::Failed);
        assert!(trace.error.as_deref().unwrap_or_default().starts_with("invalid definition"));
    }

    #[tokio::test]
    async fn run_workflow_resolves_registered_definitions() {
        let engine = WorkflowEngine::default();
        let definition = WorkflowDefinition::new("registered").with_node(start("only"));
        let workflow_id = engine.register_workflow(definition).expect("registers");

        let overrides = ContextOverrides::new().with_variable("trigger", json!({"type": "manual"}));
        let trace = engine
            .run_workflow(workflow_id, json!(5), Some(overrides))
            .await
            .expect("runs");
        assert_eq!(trace.output, Some(json!(5)));
        assert_eq!(engine.list_executions(Some(workflow_id)).len(), 1);

        let err = engine
            .run_workflow(WorkflowId::new(), json!(null), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workflow not found"));
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let engine = WorkflowEngine::default();
        let mut events = engine.subscribe();
        let definition = WorkflowDefinition::new("events").with_node(start("only"));

        let trace = engine.execute(&definition, json!({}), None).await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.execution_id(), trace.id);
            kinds.push(serde_json::to_value(&event).expect("serialize")["type"].clone());
        }
        assert_eq!(
            kinds,
            vec![
                json!("run_started"),
                json!("node_started"),
                json!("node_completed"),
                json!("run_completed")
            ]
        );
    }
}
