//! Trigger model.

use chrono::{DateTime, Utc};
use copper_relay_core::{TriggerId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::fmt;

/// The kind of stimulus a trigger listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Inbound HTTP call on a reserved path.
    Webhook,
    /// In-process named event.
    Event,
    /// Recurring schedule, driven by the scheduler.
    Schedule,
    Manual,
    Form,
    FileUpload,
    FormSubmission,
    IotStream,
    BehavioralTracking,
}

impl TriggerType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Event => "event",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::Form => "form",
            Self::FileUpload => "file_upload",
            Self::FormSubmission => "form_submission",
            Self::IotStream => "iot_stream",
            Self::BehavioralTracking => "behavioral_tracking",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered binding from a stimulus to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub config: JsonValue,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_count: u64,
}

impl Trigger {
    /// Creates an enabled trigger that has never fired.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, trigger_type: TriggerType, config: JsonValue) -> Self {
        Self {
            id: TriggerId::new(),
            trigger_type,
            workflow_id,
            config,
            enabled: true,
            created_at: Utc::now(),
            last_triggered: None,
            trigger_count: 0,
        }
    }

    /// Notes one firing.
    pub fn record_firing(&mut self) {
        self.last_triggered = Some(Utc::now());
        self.trigger_count += 1;
    }

    /// The `trigger` variable handed to runs this trigger starts.
    #[must_use]
    pub fn metadata(&self) -> JsonValue {
        json!({
            "id": self.id,
            "type": self.trigger_type,
            "config": self.config,
        })
    }
}
