use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::advise::FailureInfo;
use crate::interrupt::InterruptType;
use crate::plan::PlanNode;

/// Status of a node execution.
///
/// Transitions are monotonic: once a terminal status is reached no further
/// transition is accepted, which guards history against duplicate or
/// out-of-order async callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Queued,
    Running,
    /// Logically suspended awaiting an external callback. Non-terminal.
    AsyncWaiting,
    /// A failure strategy requires manual intervention. Non-terminal.
    InterventionWaiting,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    Skipped,
    Suspended,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Aborted
                | ExecutionStatus::Expired
                | ExecutionStatus::Skipped
                | ExecutionStatus::Suspended
        )
    }

    /// Monotonic reachability table. Any move out of a terminal state is
    /// unreachable; so is moving "backwards" (e.g. Running -> Queued).
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        if self.is_terminal() || *self == next {
            return false;
        }
        match self {
            Queued => matches!(
                next,
                Running | Skipped | Succeeded | Failed | Aborted | Expired | Suspended
            ),
            Running => matches!(
                next,
                AsyncWaiting
                    | InterventionWaiting
                    | Succeeded
                    | Failed
                    | Aborted
                    | Expired
                    | Suspended
            ),
            AsyncWaiting => matches!(
                next,
                Running | InterventionWaiting | Succeeded | Failed | Aborted | Expired | Suspended
            ),
            InterventionWaiting => {
                matches!(next, Running | Succeeded | Failed | Aborted | Expired | Suspended)
            }
            _ => false,
        }
    }
}

/// Record of an interrupt that took effect on an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub took_effect_at: DateTime<Utc>,
}

/// One runtime attempt at executing a single plan node.
///
/// Never mutated into a new attempt: a retry creates a fresh record chained
/// through `retry_ids`, so the history of prior attempts stays intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub plan_execution_id: String,
    pub node_id: String,
    pub status: ExecutionStatus,
    pub step_type: String,
    pub stage_fqn: String,
    pub parent_id: Option<String>,
    /// Ids of prior attempts in this retry chain, newest first.
    pub retry_ids: Vec<String>,
    pub interrupt_history: Vec<InterruptEffect>,
    pub failure_info: Option<FailureInfo>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn new<S: Into<String>>(
        plan_execution_id: S,
        node: &PlanNode,
        parent_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let info = node.info();
        Self {
            id: cuid2::create_id(),
            plan_execution_id: plan_execution_id.into(),
            node_id: info.node_id.clone(),
            status: ExecutionStatus::Queued,
            step_type: info.step_type.clone(),
            stage_fqn: info.stage_fqn.clone(),
            parent_id,
            retry_ids: Vec::new(),
            interrupt_history: Vec::new(),
            failure_info: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Cumulative retry count of the whole chain this attempt belongs to.
    pub fn retry_count(&self) -> u32 {
        self.retry_ids.len() as u32
    }

    /// Builds the successor attempt for a retry. The current record is left
    /// untouched; the successor is queued exactly like a fresh run and its
    /// `retry_ids` chain back through every prior attempt.
    pub fn next_attempt(&self) -> Self {
        let now = Utc::now();
        let mut retry_ids = Vec::with_capacity(self.retry_ids.len() + 1);
        retry_ids.push(self.id.clone());
        retry_ids.extend(self.retry_ids.iter().cloned());
        Self {
            id: cuid2::create_id(),
            plan_execution_id: self.plan_execution_id.clone(),
            node_id: self.node_id.clone(),
            status: ExecutionStatus::Queued,
            step_type: self.step_type.clone(),
            stage_fqn: self.stage_fqn.clone(),
            parent_id: self.parent_id.clone(),
            retry_ids,
            interrupt_history: Vec::new(),
            failure_info: None,
            created_at: now,
            last_updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::NodeInfo;

    fn exec() -> NodeExecution {
        let node = PlanNode::Step(NodeInfo::new("n1", "build", "ShellScript", "pipe.stage1"));
        NodeExecution::new("plan-1", &node, None)
    }

    #[test]
    fn terminal_states_accept_nothing() {
        use ExecutionStatus::*;
        let all = [
            Queued,
            Running,
            AsyncWaiting,
            InterventionWaiting,
            Succeeded,
            Failed,
            Aborted,
            Expired,
            Skipped,
            Suspended,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(
                    !from.can_transition_to(to),
                    "{:?} -> {:?} should be rejected",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn forward_transitions_allowed() {
        use ExecutionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(AsyncWaiting));
        assert!(AsyncWaiting.can_transition_to(Running));
        assert!(AsyncWaiting.can_transition_to(Aborted));
        assert!(Running.can_transition_to(InterventionWaiting));
        assert!(InterventionWaiting.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Queued));
        assert!(!AsyncWaiting.can_transition_to(Queued));
    }

    #[test]
    fn retry_chain_links_back() {
        let first = exec();
        let second = first.next_attempt();
        let third = second.next_attempt();

        assert_eq!(second.retry_ids, vec![first.id.clone()]);
        assert_eq!(third.retry_ids, vec![second.id.clone(), first.id.clone()]);
        assert_eq!(third.retry_count(), 2);
        assert_eq!(third.node_id, first.node_id);
        assert_ne!(third.id, first.id);
        assert_eq!(third.status, ExecutionStatus::Queued);
    }
}
