//! Integration layer for copper-relay.
//!
//! This crate provides:
//!
//! - **Connector trait**: Common interface for third-party integrations
//! - **Integration collaborator**: `IntegrationExecutor`, called by integration nodes
//! - **Action executor**: Typed leaf actions with `${...}` substitution and retry/backoff

pub mod action;
pub mod connector;
pub mod error;
pub mod retry;
pub mod substitution;

pub use action::{ActionDefinition, ActionExecutor, ActionHandler, ActionResult, ActionType};
pub use connector::{
    Connector, ConnectorInfo, ConnectorRegistry, IntegrationExecutor, Operation, OperationInfo,
};
pub use error::{ActionError, ConnectorError};
pub use retry::{BackoffStrategy, RetryOutcome, RetryPolicy};
pub use substitution::substitute;
