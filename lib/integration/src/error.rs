//! Error types for the integration crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `ConnectorError`: Errors raised by an integration connector
//! - `ActionError`: Errors raised by a leaf action handler
//!
//! Neither escapes the crate as a `Report`: the action executor folds
//! failures into an `ActionResult`, and callers of the connector registry
//! attach their own context.

use crate::action::ActionType;
use std::fmt;

/// Errors from connector operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// No connector is registered under the given id.
    ConnectorNotFound { connector_id: String },
    /// Connection to service failed.
    ConnectionFailed { reason: String },
    /// Authentication failed.
    AuthenticationFailed { reason: String },
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// Operation not supported.
    OperationNotSupported { operation: String },
    /// Invalid operation parameters.
    InvalidParameters { operation: String, reason: String },
    /// Timeout waiting for response.
    Timeout,
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectorNotFound { connector_id } => {
                write!(f, "connector not found: {connector_id}")
            }
            Self::ConnectionFailed { reason } => {
                write!(f, "connection failed: {reason}")
            }
            Self::AuthenticationFailed { reason } => {
                write!(f, "authentication failed: {reason}")
            }
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::OperationNotSupported { operation } => {
                write!(f, "operation not supported: {operation}")
            }
            Self::InvalidParameters { operation, reason } => {
                write!(f, "invalid parameters for '{operation}': {reason}")
            }
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl ConnectorError {
    /// Returns whether repeating the call could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::RateLimited { .. } | Self::Timeout
        )
    }
}

impl std::error::Error for ConnectorError {}

/// Errors from executing a single action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// No handler is registered for the action's type.
    HandlerMissing { action_type: ActionType },
    /// The action's configuration is unusable.
    InvalidConfig { reason: String },
    /// The handler ran and reported a failure.
    Failed { reason: String },
}

impl ActionError {
    /// Returns whether repeating the action could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandlerMissing { action_type } => {
                write!(f, "no handler registered for {action_type} actions")
            }
            Self::InvalidConfig { reason } => write!(f, "invalid action config: {reason}"),
            Self::Failed { reason } => write!(f, "action failed: {reason}"),
        }
    }
}

impl std::error::Error for ActionError {}

impl From<ConnectorError> for ActionError {
    fn from(err: ConnectorError) -> Self {
        if err.is_retryable() {
            Self::Failed {
                reason: err.to_string(),
            }
        } else {
            Self::InvalidConfig {
                reason: err.to_string(),
            }
        }
    }
}
