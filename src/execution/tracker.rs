use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{BatonError, Result};
use crate::execution::model::ExecutionStatus;
use crate::execution::store::ExecutionStore;
use crate::notify::{StatusEvent, StatusEvents};

/// Result of a requested status transition. `Rejected` is a logged no-op,
/// not an error: duplicate or out-of-order async callbacks routinely request
/// transitions that are no longer reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    Rejected {
        current: ExecutionStatus,
        requested: ExecutionStatus,
    },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Applies monotonic status transitions through the store's CAS primitive
/// and publishes an event for each applied one.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn ExecutionStore>,
    events: StatusEvents,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn ExecutionStore>, events: StatusEvents) -> Self {
        Self { store, events }
    }

    pub async fn transition(&self, id: &str, to: ExecutionStatus) -> Result<Transition> {
        loop {
            let exec = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| BatonError::not_found("node_execution", id))?;
            let from = exec.status;
            if !from.can_transition_to(to) {
                warn!(
                    node_execution_id = id,
                    current = ?from,
                    requested = ?to,
                    "status transition rejected"
                );
                return Ok(Transition::Rejected {
                    current: from,
                    requested: to,
                });
            }
            if self.store.update_status(id, from, to).await? {
                debug!(node_execution_id = id, ?from, ?to, "status transition applied");
                self.events.publish(StatusEvent {
                    plan_execution_id: exec.plan_execution_id.clone(),
                    node_execution_id: exec.id.clone(),
                    node_id: exec.node_id.clone(),
                    from: Some(from),
                    to,
                    at: Utc::now(),
                });
                return Ok(Transition::Applied { from, to });
            }
            // CAS lost against a concurrent writer; re-read and re-check
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::model::NodeExecution;
    use crate::execution::store::InMemoryStore;
    use crate::plan::{NodeInfo, PlanNode};

    fn setup() -> (StatusTracker, Arc<InMemoryStore>, NodeExecution) {
        let store = Arc::new(InMemoryStore::new());
        let tracker = StatusTracker::new(store.clone(), StatusEvents::new(16));
        let node = PlanNode::Step(NodeInfo::new("n1", "build", "ShellScript", "pipe.stage1"));
        let exec = NodeExecution::new("plan-1", &node, None);
        (tracker, store, exec)
    }

    #[tokio::test]
    async fn terminal_to_anything_is_rejected() {
        let (tracker, store, exec) = setup();
        store.create(&exec).await.unwrap();

        assert!(tracker
            .transition(&exec.id, ExecutionStatus::Running)
            .await
            .unwrap()
            .is_applied());
        assert!(tracker
            .transition(&exec.id, ExecutionStatus::Succeeded)
            .await
            .unwrap()
            .is_applied());

        let rejected = tracker
            .transition(&exec.id, ExecutionStatus::Running)
            .await
            .unwrap();
        assert_eq!(
            rejected,
            Transition::Rejected {
                current: ExecutionStatus::Succeeded,
                requested: ExecutionStatus::Running,
            }
        );
        assert_eq!(
            store.get(&exec.id).await.unwrap().unwrap().status,
            ExecutionStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn applied_transitions_are_published() {
        let (tracker, store, exec) = setup();
        store.create(&exec).await.unwrap();
        let mut rx = tracker.events.subscribe();

        tracker
            .transition(&exec.id, ExecutionStatus::Running)
            .await
            .unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.node_execution_id, exec.id);
        assert_eq!(ev.from, Some(ExecutionStatus::Queued));
        assert_eq!(ev.to, ExecutionStatus::Running);
    }
}
