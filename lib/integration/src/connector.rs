//! Connector trait and the integration collaborator contract.
//!
//! Concrete third-party integrations (CRM, chat, email, search, ...) live
//! outside this crate. They implement [`Connector`] and are collected in a
//! [`ConnectorRegistry`], which is what the workflow engine talks to through
//! the [`IntegrationExecutor`] trait.

use crate::error::ConnectorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Information about a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorInfo {
    /// Unique identifier for this connector type.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Description of the connector.
    pub description: String,
    /// Available operations.
    pub operations: Vec<OperationInfo>,
}

/// Information about an available operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    /// Operation name.
    pub name: String,
    /// Description of what the operation does.
    pub description: String,
}

/// An operation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// The operation name.
    pub name: String,
    /// Operation parameters.
    pub parameters: JsonValue,
}

impl Operation {
    /// Creates a new operation with no parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: JsonValue::Object(Default::default()),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        if let JsonValue::Object(ref mut map) = self.parameters {
            map.insert(key.into(), value);
        }
        self
    }

    /// Sets all parameters at once.
    #[must_use]
    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Trait for integration connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns information about this connector.
    fn info(&self) -> ConnectorInfo;

    /// Executes an operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    async fn execute(&self, operation: Operation) -> Result<JsonValue, ConnectorError>;

    /// Checks whether this connector advertises an operation.
    fn supports(&self, operation: &str) -> bool {
        self.info().operations.iter().any(|op| op.name == operation)
    }
}

/// The integration collaborator invoked by `integration` workflow nodes.
#[async_trait]
pub trait IntegrationExecutor: Send + Sync {
    /// Runs `action_name` on the connector identified by `connector_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connector is unknown or the call fails.
    async fn execute_action(
        &self,
        connector_id: &str,
        action_name: &str,
        input: JsonValue,
    ) -> Result<JsonValue, ConnectorError>;
}

/// In-process set of connectors keyed by connector id.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.connectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConnectorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connector under the id reported by its [`ConnectorInfo`].
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.register(connector);
        self
    }

    /// Adds a connector, replacing any connector with the same id.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        let id = connector.info().id;
        debug!(connector_id = %id, "registering connector");
        self.connectors.insert(id, connector);
    }

    /// Looks up a connector.
    #[must_use]
    pub fn get(&self, connector_id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(connector_id).cloned()
    }

    /// Lists information for all registered connectors, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<ConnectorInfo> {
        self.connectors.values().map(|c| c.info()).collect()
    }
}

#[async_trait]
impl IntegrationExecutor for ConnectorRegistry {
    #[instrument(skip(self, input))]
    async fn execute_action(
        &self,
        connector_id: &str,
        action_name: &str,
        input: JsonValue,
    ) -> Result<JsonValue, ConnectorError> {
        let connector = self
            .get(connector_id)
            .ok_or_else(|| ConnectorError::ConnectorNotFound {
                connector_id: connector_id.to_string(),
            })?;

        if !connector.supports(action_name) {
            return Err(ConnectorError::OperationNotSupported {
                operation: action_name.to_string(),
            });
        }

        connector
            .execute(Operation::new(action_name).with_parameters(input))
            .await
    }
}
