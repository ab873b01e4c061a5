//! Engine configuration.

use serde::Deserialize;

/// Limits applied by the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Nodes dispatched at once per run when a definition sets no limit.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Dispatch attempts per node under `error_handling = retry` when a
    /// definition has no retry policy.
    #[serde(default = "default_max_node_attempts")]
    pub max_node_attempts: u32,

    /// Events buffered per subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_node_attempts() -> u32 {
    3
}

fn default_event_buffer() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_node_attempts: default_max_node_attempts(),
            event_buffer: default_event_buffer(),
        }
    }
}
