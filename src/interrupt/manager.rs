use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{BatonError, Result};
use crate::execution::model::{InterruptEffect, NodeExecution};
use crate::execution::store::ExecutionStore;
use crate::interrupt::types::{Interrupt, InterruptState, InterruptType};

/// Registers and applies interrupts against running executions.
///
/// Application order within one node execution is priority-then-FIFO:
/// AbortAll > Abort > RetryStepGroup > Retry > Pause > Resume > Expire, with
/// registration order breaking ties. Plan-scoped interrupts are delivered at
/// most once per node.
pub struct InterruptManager {
    store: Arc<dyn ExecutionStore>,
    interrupts: DashMap<String, Interrupt>,
    /// (interrupt id, node execution id) pairs a plan-scoped interrupt has
    /// already been delivered to.
    delivered: DashMap<(String, String), ()>,
    seq: AtomicU64,
}

impl InterruptManager {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            interrupts: DashMap::new(),
            delivered: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Validates and persists an interrupt in Registered state, returning
    /// the effect token.
    ///
    /// Node-scoped interrupts fail with InvalidState when the target is not
    /// in an applicable state. A plan-scoped AbortAll racing a wrap-up in
    /// progress does not error; it is recorded ProcessedUnsuccessfully.
    pub async fn register(&self, mut interrupt: Interrupt) -> Result<InterruptEffect> {
        if interrupt.interrupt_type.is_plan_scoped() {
            let active = self
                .store
                .active_for_plan(&interrupt.plan_execution_id)
                .await?;
            if active.is_empty() {
                warn!(
                    plan_execution_id = %interrupt.plan_execution_id,
                    "plan has no active executions; abort-all lost the wrap-up race"
                );
                interrupt.state = InterruptState::ProcessedUnsuccessfully;
            } else {
                // an abort-all supersedes any pending retry for the plan
                self.supersede_pending_retries(&interrupt.plan_execution_id);
            }
        } else if interrupt.interrupt_type == InterruptType::RetryStepGroup {
            if interrupt.group.is_empty() {
                return Err(BatonError::invalid_state(
                    "interrupt",
                    interrupt.id.clone(),
                    "step-group retry without members".to_string(),
                ));
            }
            for member in &interrupt.group {
                let exec = self
                    .store
                    .get(member)
                    .await?
                    .ok_or_else(|| BatonError::not_found("node_execution", member.as_str()))?;
                self.validate_target(&interrupt, &exec)?;
            }
        } else {
            let target = interrupt.node_execution_id.clone().ok_or_else(|| {
                BatonError::invalid_state(
                    "interrupt",
                    interrupt.id.clone(),
                    "node-scoped interrupt without a target".to_string(),
                )
            })?;
            let exec = self
                .store
                .get(&target)
                .await?
                .ok_or_else(|| BatonError::not_found("node_execution", target.as_str()))?;
            self.validate_target(&interrupt, &exec)?;
        }

        interrupt.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let effect = InterruptEffect {
            interrupt_id: interrupt.id.clone(),
            interrupt_type: interrupt.interrupt_type,
            took_effect_at: interrupt.created_at,
        };
        info!(
            interrupt_id = %interrupt.id,
            interrupt_type = ?interrupt.interrupt_type,
            state = ?interrupt.state,
            "interrupt registered"
        );
        self.interrupts.insert(interrupt.id.clone(), interrupt);
        Ok(effect)
    }

    fn validate_target(&self, interrupt: &Interrupt, exec: &NodeExecution) -> Result<()> {
        match interrupt.interrupt_type {
            // retries revive a concluded attempt
            InterruptType::Retry | InterruptType::RetryStepGroup => {
                if !exec.status.is_terminal() {
                    return Err(BatonError::invalid_state(
                        "node_execution",
                        exec.id.clone(),
                        format!("cannot retry non-terminal execution ({:?})", exec.status),
                    ));
                }
            }
            // everything else only makes sense against a live execution
            _ => {
                if exec.status.is_terminal() {
                    return Err(BatonError::invalid_state(
                        "node_execution",
                        exec.id.clone(),
                        format!("execution already terminal ({:?})", exec.status),
                    ));
                }
            }
        }
        Ok(())
    }

    fn supersede_pending_retries(&self, plan_execution_id: &str) {
        for mut entry in self.interrupts.iter_mut() {
            if entry.plan_execution_id == plan_execution_id
                && entry.state == InterruptState::Registered
                && matches!(
                    entry.interrupt_type,
                    InterruptType::Retry | InterruptType::RetryStepGroup
                )
            {
                debug!(interrupt_id = %entry.id, "pending retry superseded by abort-all");
                entry.state = InterruptState::ProcessedUnsuccessfully;
            }
        }
    }

    /// Withdraws a Pause that has not yet reached an advice boundary. Called
    /// when a Resume for the same node arrives first.
    pub fn cancel_pending_pause(&self, node_execution_id: &str) {
        for mut entry in self.interrupts.iter_mut() {
            if entry.state == InterruptState::Registered
                && entry.interrupt_type == InterruptType::Pause
                && entry.node_execution_id.as_deref() == Some(node_execution_id)
            {
                debug!(interrupt_id = %entry.id, "pending pause withdrawn by resume");
                entry.state = InterruptState::ProcessedUnsuccessfully;
            }
        }
    }

    /// The highest-priority unprocessed interrupt for a node, marked
    /// Processing. Equal priorities come back in registration order.
    ///
    /// Concurrent calls for the same node contend on the claim, not the
    /// scan: a plan-scoped interrupt is claimed by winning the delivery
    /// entry, a node-scoped one by flipping Registered to Processing. A
    /// loser rescans for the next candidate.
    pub async fn apply(&self, node_execution_id: &str) -> Option<Interrupt> {
        let exec = match self.store.get(node_execution_id).await {
            Ok(Some(exec)) => exec,
            Ok(None) => {
                warn!(node_execution_id, "apply called for unknown execution");
                return None;
            }
            Err(err) => {
                warn!(node_execution_id, error = %err, "apply could not load execution");
                return None;
            }
        };

        loop {
            let mut best: Option<Interrupt> = None;
            for entry in self.interrupts.iter() {
                let candidate = entry.value();
                if !candidate.is_unprocessed() {
                    continue;
                }
                let applies = if candidate.interrupt_type.is_plan_scoped() {
                    candidate.plan_execution_id == exec.plan_execution_id
                        && !self
                            .delivered
                            .contains_key(&(candidate.id.clone(), exec.id.clone()))
                } else {
                    candidate.state == InterruptState::Registered
                        && candidate.node_execution_id.as_deref() == Some(node_execution_id)
                };
                if !applies {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some(current) => {
                        let (cp, bp) = (
                            candidate.interrupt_type.priority(),
                            current.interrupt_type.priority(),
                        );
                        cp > bp || (cp == bp && candidate.seq < current.seq)
                    }
                };
                if better {
                    best = Some(candidate.clone());
                }
            }

            let chosen = best?;
            if chosen.interrupt_type.is_plan_scoped() {
                match self.delivered.entry((chosen.id.clone(), exec.id.clone())) {
                    Entry::Occupied(_) => continue,
                    Entry::Vacant(slot) => {
                        slot.insert(());
                    }
                }
                if let Some(mut stored) = self.interrupts.get_mut(&chosen.id) {
                    stored.state = InterruptState::Processing;
                }
            } else {
                let claimed = match self.interrupts.get_mut(&chosen.id) {
                    Some(mut stored) if stored.state == InterruptState::Registered => {
                        stored.state = InterruptState::Processing;
                        true
                    }
                    _ => false,
                };
                if !claimed {
                    continue;
                }
            }
            debug!(
                interrupt_id = %chosen.id,
                node_execution_id,
                interrupt_type = ?chosen.interrupt_type,
                "interrupt applied"
            );
            return Some(chosen);
        }
    }

    pub fn mark_processed(&self, interrupt_id: &str, success: bool) {
        if let Some(mut stored) = self.interrupts.get_mut(interrupt_id) {
            stored.state = if success {
                InterruptState::ProcessedSuccessfully
            } else {
                InterruptState::ProcessedUnsuccessfully
            };
        }
    }

    pub fn get(&self, interrupt_id: &str) -> Option<Interrupt> {
        self.interrupts.get(interrupt_id).map(|i| i.clone())
    }

    /// Creates the successor attempt for a retried execution and queues it
    /// as a fresh run. The prior attempt is never mutated.
    pub async fn retry_execution(&self, node_execution_id: &str) -> Result<NodeExecution> {
        let exec = self
            .store
            .get(node_execution_id)
            .await?
            .ok_or_else(|| BatonError::not_found("node_execution", node_execution_id))?;
        if !exec.status.is_terminal() {
            return Err(BatonError::invalid_state(
                "node_execution",
                exec.id.clone(),
                format!("cannot retry non-terminal execution ({:?})", exec.status),
            ));
        }
        let successor = exec.next_attempt();
        self.store.create(&successor).await?;
        info!(
            node_execution_id,
            successor_id = %successor.id,
            chain_length = successor.retry_count(),
            "retry attempt queued"
        );
        Ok(successor)
    }

    /// All-or-nothing retry of a sibling group. Successors are staged one by
    /// one; the first failure rolls back everything already staged and
    /// surfaces a single error.
    pub async fn retry_step_group(&self, group: &[String]) -> Result<Vec<NodeExecution>> {
        // validate the whole group up front
        let mut priors = Vec::with_capacity(group.len());
        for id in group {
            let exec = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| BatonError::not_found("node_execution", id.as_str()))?;
            if !exec.status.is_terminal() {
                return Err(BatonError::GroupRetryPartialFailure {
                    group_size: group.len(),
                    message: format!("sibling '{}' is not terminal ({:?})", id, exec.status),
                });
            }
            priors.push(exec);
        }

        let mut staged: Vec<NodeExecution> = Vec::with_capacity(group.len());
        for prior in &priors {
            let successor = prior.next_attempt();
            if let Err(err) = self.store.create(&successor).await {
                warn!(
                    failed_sibling = %prior.id,
                    staged = staged.len(),
                    error = %err,
                    "step-group retry staging failed; rolling back"
                );
                for created in &staged {
                    if let Err(rollback_err) = self.store.remove(&created.id).await {
                        warn!(
                            execution_id = %created.id,
                            error = %rollback_err,
                            "failed to roll back staged retry attempt"
                        );
                    }
                }
                return Err(BatonError::GroupRetryPartialFailure {
                    group_size: group.len(),
                    message: format!("sibling '{}' could not be re-queued: {}", prior.id, err),
                });
            }
            staged.push(successor);
        }
        info!(group_size = staged.len(), "step-group retry queued");
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::model::ExecutionStatus;
    use crate::execution::store::InMemoryStore;
    use crate::interrupt::types::InterruptIssuer;
    use crate::plan::{NodeInfo, PlanNode};

    async fn seeded() -> (InterruptManager, Arc<InMemoryStore>, NodeExecution) {
        let store = Arc::new(InMemoryStore::new());
        let node = PlanNode::Step(NodeInfo::new("n1", "build", "ShellScript", "pipe.s1"));
        let exec = NodeExecution::new("plan-1", &node, None);
        store.create(&exec).await.unwrap();
        store
            .update_status(&exec.id, ExecutionStatus::Queued, ExecutionStatus::Running)
            .await
            .unwrap();
        (InterruptManager::new(store.clone()), store, exec)
    }

    fn node_interrupt(exec: &NodeExecution, ty: InterruptType) -> Interrupt {
        Interrupt::new(
            exec.plan_execution_id.clone(),
            Some(exec.id.clone()),
            ty,
            InterruptIssuer::User,
        )
    }

    #[tokio::test]
    async fn register_against_terminal_node_fails() {
        let (manager, store, exec) = seeded().await;
        store
            .update_status(&exec.id, ExecutionStatus::Running, ExecutionStatus::Succeeded)
            .await
            .unwrap();
        let err = manager
            .register(node_interrupt(&exec, InterruptType::Abort))
            .await
            .unwrap_err();
        assert!(matches!(err, BatonError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn apply_is_priority_then_fifo() {
        let (manager, _store, exec) = seeded().await;

        manager
            .register(node_interrupt(&exec, InterruptType::Pause))
            .await
            .unwrap();
        manager
            .register(node_interrupt(&exec, InterruptType::Resume))
            .await
            .unwrap();
        manager
            .register(node_interrupt(&exec, InterruptType::Abort))
            .await
            .unwrap();
        // second Pause, registered after the first
        manager
            .register(node_interrupt(&exec, InterruptType::Pause))
            .await
            .unwrap();

        let order: Vec<InterruptType> = {
            let mut out = Vec::new();
            while let Some(interrupt) = manager.apply(&exec.id).await {
                out.push(interrupt.interrupt_type);
                manager.mark_processed(&interrupt.id, true);
            }
            out
        };
        assert_eq!(
            order,
            vec![
                InterruptType::Abort,
                InterruptType::Pause,
                InterruptType::Pause,
                InterruptType::Resume,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_applies_claim_an_interrupt_once() {
        let (manager, _store, exec) = seeded().await;
        let manager = Arc::new(manager);
        manager
            .register(node_interrupt(&exec, InterruptType::Pause))
            .await
            .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let id = exec.id.clone();
                tokio::spawn(async move { manager.apply(&id).await })
            })
            .collect();

        let mut claims = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                claims += 1;
            }
        }
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn resume_withdraws_a_registered_pause() {
        let (manager, _store, exec) = seeded().await;
        let pause = node_interrupt(&exec, InterruptType::Pause);
        let pause_id = pause.id.clone();
        manager.register(pause).await.unwrap();

        manager.cancel_pending_pause(&exec.id);
        assert_eq!(
            manager.get(&pause_id).unwrap().state,
            InterruptState::ProcessedUnsuccessfully
        );
        assert!(manager.apply(&exec.id).await.is_none());
    }

    #[tokio::test]
    async fn abort_all_supersedes_pending_retries() {
        let (manager, store, exec) = seeded().await;
        // a second, failed execution that has a pending retry
        let node = PlanNode::Step(NodeInfo::new("n2", "test", "ShellScript", "pipe.s1"));
        let failed = NodeExecution::new("plan-1", &node, None);
        store.create(&failed).await.unwrap();
        store
            .update_status(&failed.id, ExecutionStatus::Queued, ExecutionStatus::Failed)
            .await
            .unwrap();

        let retry = node_interrupt(&failed, InterruptType::Retry);
        let retry_id = retry.id.clone();
        manager.register(retry).await.unwrap();

        manager
            .register(Interrupt::new(
                "plan-1".to_string(),
                None,
                InterruptType::AbortAll,
                InterruptIssuer::User,
            ))
            .await
            .unwrap();

        assert_eq!(
            manager.get(&retry_id).unwrap().state,
            InterruptState::ProcessedUnsuccessfully
        );
        // the abort-all is delivered to the running node, the retry is not
        let applied = manager.apply(&exec.id).await.unwrap();
        assert_eq!(applied.interrupt_type, InterruptType::AbortAll);
    }

    #[tokio::test]
    async fn abort_all_against_finished_plan_is_unsuccessful_not_error() {
        let (manager, store, exec) = seeded().await;
        store
            .update_status(&exec.id, ExecutionStatus::Running, ExecutionStatus::Succeeded)
            .await
            .unwrap();

        let effect = manager
            .register(Interrupt::new(
                "plan-1".to_string(),
                None,
                InterruptType::AbortAll,
                InterruptIssuer::User,
            ))
            .await
            .unwrap();
        assert_eq!(
            manager.get(&effect.interrupt_id).unwrap().state,
            InterruptState::ProcessedUnsuccessfully
        );
    }

    #[tokio::test]
    async fn retry_builds_a_chained_successor() {
        let (manager, store, exec) = seeded().await;
        store
            .update_status(&exec.id, ExecutionStatus::Running, ExecutionStatus::Failed)
            .await
            .unwrap();

        let successor = manager.retry_execution(&exec.id).await.unwrap();
        assert_eq!(successor.retry_ids, vec![exec.id.clone()]);
        assert_eq!(successor.status, ExecutionStatus::Queued);
        assert_eq!(successor.node_id, exec.node_id);
        // prior attempt untouched
        assert_eq!(
            store.get(&exec.id).await.unwrap().unwrap().status,
            ExecutionStatus::Failed
        );
    }

    #[tokio::test]
    async fn retry_of_running_execution_is_invalid() {
        let (manager, _store, exec) = seeded().await;
        let err = manager.retry_execution(&exec.id).await.unwrap_err();
        assert!(matches!(err, BatonError::InvalidState { .. }));
    }
}
