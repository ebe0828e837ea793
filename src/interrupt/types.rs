use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control-signal kinds, ordered by application priority (see
/// [`InterruptType::priority`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterruptType {
    AbortAll,
    Abort,
    RetryStepGroup,
    Retry,
    Pause,
    Resume,
    Expire,
}

impl InterruptType {
    /// Higher wins. AbortAll > Abort > RetryStepGroup > Retry > Pause >
    /// Resume > Expire; equal priority is FIFO by registration order.
    pub fn priority(&self) -> u8 {
        match self {
            InterruptType::AbortAll => 6,
            InterruptType::Abort => 5,
            InterruptType::RetryStepGroup => 4,
            InterruptType::Retry => 3,
            InterruptType::Pause => 2,
            InterruptType::Resume => 1,
            InterruptType::Expire => 0,
        }
    }

    /// Plan-scoped interrupts target every active execution of the plan.
    pub fn is_plan_scoped(&self) -> bool {
        matches!(self, InterruptType::AbortAll)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptIssuer {
    User,
    System,
    Adviser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

/// An asynchronous control signal against a node or whole plan execution.
/// Consumed exactly once; immutable once processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: String,
    pub plan_execution_id: String,
    /// None for plan-level interrupts.
    pub node_execution_id: Option<String>,
    pub interrupt_type: InterruptType,
    pub issued_by: InterruptIssuer,
    pub state: InterruptState,
    /// Node-execution ids of the sibling group; only set for RetryStepGroup.
    pub group: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub(crate) seq: u64,
}

impl Interrupt {
    pub fn new<S: Into<String>>(
        plan_execution_id: S,
        node_execution_id: Option<String>,
        interrupt_type: InterruptType,
        issued_by: InterruptIssuer,
    ) -> Self {
        Self {
            id: cuid2::create_id(),
            plan_execution_id: plan_execution_id.into(),
            node_execution_id,
            interrupt_type,
            issued_by,
            state: InterruptState::Registered,
            group: Vec::new(),
            created_at: Utc::now(),
            seq: 0,
        }
    }

    pub fn with_group(mut self, group: Vec<String>) -> Self {
        self.group = group;
        self
    }

    pub fn is_unprocessed(&self) -> bool {
        matches!(
            self.state,
            InterruptState::Registered | InterruptState::Processing
        )
    }
}
