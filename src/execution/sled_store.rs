use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{BatonError, Result};
use crate::execution::model::{ExecutionStatus, NodeExecution};
use crate::execution::store::ExecutionStore;

const EXECUTIONS_TREE: &str = "node_executions";

/// Embedded sled-backed store; records are bincode-encoded. Lookups scan
/// the tree, which is fine at plan sizes but is not an indexing strategy.
pub struct SledStore {
    tree: sled::Tree,
    /// Sled's compare_and_swap guards the id key only; this serializes the
    /// one-active-per-node scan with the insert.
    create_guard: Mutex<()>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(EXECUTIONS_TREE)?;
        Ok(Self {
            tree,
            create_guard: Mutex::new(()),
        })
    }

    /// In-memory sled database; used in tests.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(EXECUTIONS_TREE)?;
        Ok(Self {
            tree,
            create_guard: Mutex::new(()),
        })
    }

    fn decode(raw: &sled::IVec) -> Result<NodeExecution> {
        Ok(bincode::deserialize(raw)?)
    }

    fn encode(exec: &NodeExecution) -> Result<Vec<u8>> {
        Ok(bincode::serialize(exec)?)
    }

    fn scan(&self) -> Result<Vec<NodeExecution>> {
        let mut out = Vec::new();
        for kv in self.tree.iter() {
            let (_, raw) = kv?;
            out.push(Self::decode(&raw)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ExecutionStore for SledStore {
    async fn create(&self, exec: &NodeExecution) -> Result<()> {
        let _guard = self
            .create_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for existing in self.scan()? {
            if existing.plan_execution_id == exec.plan_execution_id
                && existing.node_id == exec.node_id
                && !existing.status.is_terminal()
            {
                return Err(BatonError::invalid_state(
                    "node_execution",
                    exec.id.clone(),
                    format!("active execution already exists for node '{}'", exec.node_id),
                ));
            }
        }
        let encoded = Self::encode(exec)?;
        match self
            .tree
            .compare_and_swap(exec.id.as_bytes(), None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(BatonError::invalid_state(
                "node_execution",
                exec.id.clone(),
                "duplicate execution id".to_string(),
            )),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<NodeExecution>> {
        match self.tree.get(id.as_bytes())? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: &str,
        expected: ExecutionStatus,
        new: ExecutionStatus,
    ) -> Result<bool> {
        loop {
            let Some(raw) = self.tree.get(id.as_bytes())? else {
                return Err(BatonError::not_found("node_execution", id));
            };
            let mut exec = Self::decode(&raw)?;
            if exec.status != expected {
                debug!(id, current = ?exec.status, ?expected, "status CAS lost");
                return Ok(false);
            }
            exec.status = new;
            exec.last_updated_at = Utc::now();
            let encoded = Self::encode(&exec)?;
            match self
                .tree
                .compare_and_swap(id.as_bytes(), Some(raw), Some(encoded))?
            {
                Ok(()) => return Ok(true),
                // concurrent writer; reload and re-check
                Err(_) => continue,
            }
        }
    }

    async fn save(&self, exec: &NodeExecution) -> Result<()> {
        if self.tree.get(exec.id.as_bytes())?.is_none() {
            return Err(BatonError::not_found("node_execution", exec.id.as_str()));
        }
        let mut updated = exec.clone();
        updated.last_updated_at = Utc::now();
        self.tree
            .insert(exec.id.as_bytes(), Self::encode(&updated)?)?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.tree.remove(id.as_bytes())?;
        Ok(())
    }

    async fn active_for_node(
        &self,
        plan_execution_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeExecution>> {
        Ok(self.scan()?.into_iter().find(|e| {
            e.plan_execution_id == plan_execution_id
                && e.node_id == node_id
                && !e.status.is_terminal()
        }))
    }

    async fn active_for_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|e| e.plan_execution_id == plan_execution_id && !e.status.is_terminal())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{NodeInfo, PlanNode};

    fn exec(plan: &str, node: &str) -> NodeExecution {
        let node = PlanNode::Step(NodeInfo::new(node, node, "ShellScript", "pipe.stage1"));
        NodeExecution::new(plan, &node, None)
    }

    #[tokio::test]
    async fn round_trips_through_bincode() {
        let store = SledStore::temporary().unwrap();
        let e = exec("plan-1", "n1");
        store.create(&e).await.unwrap();

        let loaded = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, e.id);
        assert_eq!(loaded.node_id, "n1");
        assert_eq!(loaded.status, ExecutionStatus::Queued);
    }

    #[tokio::test]
    async fn cas_and_one_active_invariant() {
        let store = SledStore::temporary().unwrap();
        let e = exec("plan-1", "n1");
        store.create(&e).await.unwrap();

        assert!(store.create(&exec("plan-1", "n1")).await.is_err());

        assert!(store
            .update_status(&e.id, ExecutionStatus::Queued, ExecutionStatus::Running)
            .await
            .unwrap());
        assert!(!store
            .update_status(&e.id, ExecutionStatus::Queued, ExecutionStatus::Failed)
            .await
            .unwrap());

        assert_eq!(store.active_for_plan("plan-1").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn racing_creates_for_one_node_admit_a_single_active() {
        let store = std::sync::Arc::new(SledStore::temporary().unwrap());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let e = exec("plan-1", "n1");
                tokio::spawn(async move { store.create(&e).await })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.active_for_plan("plan-1").await.unwrap().len(), 1);
    }
}
