//! Workflow store.
//!
//! Holds registered definitions and execution records. Both live in
//! [`Repository`] implementations so a durable backend can replace the
//! in-memory one without touching the engine.
//!
//! The execution repository is the only state shared between concurrent
//! runs; every operation takes its lock for the duration of one call.

use crate::definition::{WorkflowDefinition, WorkflowSummary};
use crate::error::WorkflowError;
use crate::execution::WorkflowExecution;
use copper_relay_core::{ExecutionId, WorkflowId};
use rootcause::Report;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Keyed record storage.
pub trait Repository<K, V>: Send + Sync {
    /// Returns a copy of the record.
    fn get(&self, key: &K) -> Option<V>;

    /// Inserts or replaces a record. Returns the previous record.
    fn put(&self, key: K, value: V) -> Option<V>;

    /// Removes a record.
    fn delete(&self, key: &K) -> Option<V>;

    /// Returns all records in insertion order.
    fn list(&self) -> Vec<V>;

    /// Mutates a record in place. Returns false if it does not exist.
    fn update(&self, key: &K, apply: &mut dyn FnMut(&mut V)) -> bool;
}

/// Arena-backed in-memory repository.
///
/// Records sit in a slot vector; deleted slots are left empty so indexes
/// stay stable and listing keeps insertion order.
pub struct InMemoryRepository<K, V> {
    inner: RwLock<Arena<K, V>>,
}

struct Arena<K, V> {
    slots: Vec<Option<V>>,
    index: HashMap<K, usize>,
}

impl<K, V> Default for InMemoryRepository<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Arena {
                slots: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }
}

impl<K, V> InMemoryRepository<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V> Repository<K, V> for InMemoryRepository<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        let arena = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let slot = *arena.index.get(key)?;
        arena.slots.get(slot).cloned().flatten()
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        let mut arena = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&slot) = arena.index.get(&key) {
            return arena.slots[slot].replace(value);
        }
        let slot = arena.slots.len();
        arena.slots.push(Some(value));
        arena.index.insert(key, slot);
        None
    }

    fn delete(&self, key: &K) -> Option<V> {
        let mut arena = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let slot = arena.index.remove(key)?;
        arena.slots[slot].take()
    }

    fn list(&self) -> Vec<V> {
        let arena = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        arena.slots.iter().flatten().cloned().collect()
    }

    fn update(&self, key: &K, apply: &mut dyn FnMut(&mut V)) -> bool {
        let mut arena = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(&slot) = arena.index.get(key) else {
            return false;
        };
        match arena.slots[slot].as_mut() {
            Some(value) => {
                apply(value);
                true
            }
            None => false,
        }
    }
}

/// Definitions and execution history.
#[derive(Clone)]
pub struct WorkflowStore {
    workflows: Arc<dyn Repository<WorkflowId, WorkflowDefinition>>,
    executions: Arc<dyn Repository<ExecutionId, WorkflowExecution>>,
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl WorkflowStore {
    /// Creates a store over the given repositories.
    #[must_use]
    pub fn new(
        workflows: Arc<dyn Repository<WorkflowId, WorkflowDefinition>>,
        executions: Arc<dyn Repository<ExecutionId, WorkflowExecution>>,
    ) -> Self {
        Self {
            workflows,
            executions,
        }
    }

    /// Creates a store backed by in-memory repositories.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
        )
    }

    /// Validates and stores a new definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is invalid or its id is taken.
    pub fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowId, Report<WorkflowError>> {
        let workflow_id = definition.id;
        definition
            .validate()
            .map_err(|source| WorkflowError::InvalidDefinition {
                workflow_id,
                source,
            })?;
        if self.workflows.get(&workflow_id).is_some() {
            return Err(WorkflowError::AlreadyExists { workflow_id }.into());
        }
        self.workflows.put(workflow_id, definition);
        debug!(%workflow_id, "workflow registered");
        Ok(workflow_id)
    }

    /// Validates and replaces an existing definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is invalid or not registered.
    pub fn update_workflow(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<(), Report<WorkflowError>> {
        let workflow_id = definition.id;
        definition
            .validate()
            .map_err(|source| WorkflowError::InvalidDefinition {
                workflow_id,
                source,
            })?;
        if self.workflows.get(&workflow_id).is_none() {
            return Err(WorkflowError::NotFound { workflow_id }.into());
        }
        definition.touch();
        self.workflows.put(workflow_id, definition);
        debug!(%workflow_id, "workflow updated");
        Ok(())
    }

    /// Returns a definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow is not registered.
    pub fn get_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, Report<WorkflowError>> {
        self.workflows
            .get(&workflow_id)
            .ok_or_else(|| WorkflowError::NotFound { workflow_id }.into())
    }

    /// Lists registered workflows in registration order.
    #[must_use]
    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.workflows
            .list()
            .iter()
            .map(WorkflowSummary::from)
            .collect()
    }

    /// Removes a definition. Its execution history is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow is not registered.
    pub fn remove_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, Report<WorkflowError>> {
        self.workflows
            .delete(&workflow_id)
            .ok_or_else(|| WorkflowError::NotFound { workflow_id }.into())
    }

    /// Stores (or replaces) an execution record.
    pub fn record_execution(&self, execution: WorkflowExecution) {
        self.executions.put(execution.id, execution);
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
        self.executions
            .get(&execution_id)
            .ok_or_else(|| WorkflowError::ExecutionNotFound { execution_id }.into())
    }

    /// Lists executions in start order, optionally for one workflow.
    #[must_use]
    pub fn list_executions(&self, workflow_id: Option<WorkflowId>) -> Vec<WorkflowExecution> {
        self.executions
            .list()
            .into_iter()
            .filter(|execution| workflow_id.is_none_or(|id| execution.workflow_id == id))
            .collect()
    }

    /// Mutates an execution record in place.
    ///
    /// # Errors
    ///
    /// Returns an error if no such execution exists.
    pub fn update_execution<R>(
        &self,
        execution_id: ExecutionId,
        apply: impl FnOnce(&mut WorkflowExecution) -> R,
    ) -> Result<R, Report<WorkflowError>> {
        let mut apply = Some(apply);
        let mut result = None;
        let found = self.executions.update(&execution_id, &mut |execution| {
            if let Some(apply) = apply.take() {
                result = Some(apply(execution));
            }
        });
        match (found, result) {
            (true, Some(result)) => Ok(result),
            _ => Err(WorkflowError::ExecutionNotFound { execution_id }.into()),
        }
    }
}
