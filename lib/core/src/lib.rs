//! Core domain types and utilities for copper-relay.
//!
//! This crate provides the identifiers, error handling alias and JSON path
//! helpers shared by the workflow engine, the action executor and the
//! trigger layer.

pub mod error;
pub mod id;
pub mod path;

pub use error::Result;
pub use id::{
    ExecutionId, JobId, ParseIdError, SessionId, TriggerId, UserId, WorkflowId, WorkspaceId,
};
