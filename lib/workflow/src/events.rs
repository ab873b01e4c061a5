//! Execution events.
//!
//! The engine publishes one event per state change of a run or a node on a
//! broadcast channel. Subscribers that fall behind miss events; publishing
//! without subscribers is fine.

use crate::node::NodeId;
use chrono::{DateTime, Utc};
use copper_relay_core::{ExecutionId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

/// Events for workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Run started executing.
    RunStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    /// Node dispatch started.
    NodeStarted {
        execution_id: ExecutionId,
        node_id: NodeId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// Node completed successfully.
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        output: JsonValue,
        timestamp: DateTime<Utc>,
    },
    /// Node failed.
    NodeFailed {
        execution_id: ExecutionId,
        node_id: NodeId,
        attempt: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Node was skipped because no incoming connection was traversed.
    NodeSkipped {
        execution_id: ExecutionId,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    /// Run completed.
    RunCompleted {
        execution_id: ExecutionId,
        output: JsonValue,
        timestamp: DateTime<Utc>,
    },
    /// Run failed.
    RunFailed {
        execution_id: ExecutionId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Run was stopped.
    RunStopped {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Returns the execution ID associated with this event.
    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::NodeStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::NodeSkipped { execution_id, .. }
            | Self::RunCompleted { execution_id, .. }
            | Self::RunFailed { execution_id, .. }
            | Self::RunStopped { execution_id, .. } => *execution_id,
        }
    }

    /// Returns the timestamp of this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { timestamp, .. }
            | Self::NodeStarted { timestamp, .. }
            | Self::NodeCompleted { timestamp, .. }
            | Self::NodeFailed { timestamp, .. }
            | Self::NodeSkipped { timestamp, .. }
            | Self::RunCompleted { timestamp, .. }
            | Self::RunFailed { timestamp, .. }
            | Self::RunStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Returns true for the last event of a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunStopped { .. }
        )
    }
}

/// Fan-out of execution events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to current subscribers.
    pub fn publish(&self, event: ExecutionEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let execution_id = ExecutionId::new();

        bus.publish(ExecutionEvent::RunStopped {
            execution_id,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.expect("event");
        assert_eq!(event.execution_id(), execution_id);
        assert!(event.is_terminal());
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        bus.publish(ExecutionEvent::NodeSkipped {
            execution_id: ExecutionId::new(),
            node_id: NodeId::new("n"),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn events_are_tagged_by_type() {
        let event = ExecutionEvent::NodeFailed {
            execution_id: ExecutionId::new(),
            node_id: NodeId::new("fetch"),
            attempt: 2,
            error: "timeout".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "node_failed");
        assert_eq!(json["node_id"], "fetch");
        assert!(!event.is_terminal());
    }
}
