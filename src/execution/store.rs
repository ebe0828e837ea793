use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{BatonError, Result};
use crate::execution::model::{ExecutionStatus, NodeExecution};

/// Persistence contract for node executions.
///
/// Conditional updates (`update_status`) are the concurrency primitive the
/// whole engine leans on: multiple producers (resume callback, interrupt,
/// expiry sweep) may race on the same record and exactly one must win.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Creates a new execution record. Fails if an id collision occurs or if
    /// another non-terminal execution already exists for the same
    /// (plan_execution_id, node_id) pair.
    async fn create(&self, exec: &NodeExecution) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<NodeExecution>>;

    /// Compare-and-set on status. Returns false (and writes nothing) when
    /// the current status differs from `expected`.
    async fn update_status(
        &self,
        id: &str,
        expected: ExecutionStatus,
        new: ExecutionStatus,
    ) -> Result<bool>;

    /// Full-record write for fields other than status (failure info,
    /// interrupt history).
    async fn save(&self, exec: &NodeExecution) -> Result<()>;

    /// Removes a record. Only used to roll back a partially staged
    /// step-group retry.
    async fn remove(&self, id: &str) -> Result<()>;

    /// The single active (non-terminal) execution for a plan node, if any.
    async fn active_for_node(
        &self,
        plan_execution_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeExecution>>;

    /// All active executions of a plan run.
    async fn active_for_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>>;
}

/// DashMap-backed store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    items: DashMap<String, NodeExecution>,
    /// Serializes the one-active-per-node check with the insert; racing
    /// creates for the same (plan_execution_id, node_id) must admit one.
    create_guard: std::sync::Mutex<()>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create(&self, exec: &NodeExecution) -> Result<()> {
        let _guard = self
            .create_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let clash = self.items.iter().any(|e| {
            e.plan_execution_id == exec.plan_execution_id
                && e.node_id == exec.node_id
                && !e.status.is_terminal()
        });
        if clash {
            return Err(BatonError::invalid_state(
                "node_execution",
                exec.id.clone(),
                format!("active execution already exists for node '{}'", exec.node_id),
            ));
        }
        match self.items.entry(exec.id.clone()) {
            Entry::Occupied(_) => Err(BatonError::invalid_state(
                "node_execution",
                exec.id.clone(),
                "duplicate execution id".to_string(),
            )),
            Entry::Vacant(v) => {
                v.insert(exec.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<NodeExecution>> {
        Ok(self.items.get(id).map(|e| e.clone()))
    }

    async fn update_status(
        &self,
        id: &str,
        expected: ExecutionStatus,
        new: ExecutionStatus,
    ) -> Result<bool> {
        let mut entry = self
            .items
            .get_mut(id)
            .ok_or_else(|| BatonError::not_found("node_execution", id))?;
        if entry.status != expected {
            debug!(
                id,
                current = ?entry.status,
                ?expected,
                "status CAS lost"
            );
            return Ok(false);
        }
        entry.status = new;
        entry.last_updated_at = Utc::now();
        Ok(true)
    }

    async fn save(&self, exec: &NodeExecution) -> Result<()> {
        let mut entry = self
            .items
            .get_mut(&exec.id)
            .ok_or_else(|| BatonError::not_found("node_execution", exec.id.as_str()))?;
        let mut updated = exec.clone();
        updated.last_updated_at = Utc::now();
        *entry = updated;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.items.remove(id);
        Ok(())
    }

    async fn active_for_node(
        &self,
        plan_execution_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeExecution>> {
        Ok(self
            .items
            .iter()
            .find(|e| {
                e.plan_execution_id == plan_execution_id
                    && e.node_id == node_id
                    && !e.status.is_terminal()
            })
            .map(|e| e.clone()))
    }

    async fn active_for_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self
            .items
            .iter()
            .filter(|e| e.plan_execution_id == plan_execution_id && !e.status.is_terminal())
            .map(|e| e.clone())
            .collect())
    }
}
