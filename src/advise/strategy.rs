use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classified failure produced by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    Connectivity,
    Timeout,
    Authentication,
    Authorization,
    Verification,
    Application,
    Unknown,
}

/// What a step reported back to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepResponse {
    Success {
        payload: Option<Value>,
    },
    Failure {
        failure_type: FailureType,
        message: String,
    },
}

impl StepResponse {
    pub fn success() -> Self {
        StepResponse::Success { payload: None }
    }

    pub fn failure<S: Into<String>>(failure_type: FailureType, message: S) -> Self {
        StepResponse::Failure {
            failure_type,
            message: message.into(),
        }
    }
}

/// Declared failure-type pattern. Exact patterns are more specific than the
/// wildcard and win when both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePattern {
    Exact(FailureType),
    Wildcard,
}

impl FailurePattern {
    pub fn matches(&self, failure_type: FailureType) -> bool {
        match self {
            FailurePattern::Exact(ft) => *ft == failure_type,
            FailurePattern::Wildcard => true,
        }
    }

    pub fn specificity(&self) -> u8 {
        match self {
            FailurePattern::Exact(_) => 1,
            FailurePattern::Wildcard => 0,
        }
    }
}

/// Which part of the pipeline a rollback targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackStrategy {
    Stage,
    PriorStage,
    Pipeline,
}

/// Recovery action a failure strategy yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyAction {
    /// Behaves as PROCEED; the failure is recorded but not acted on.
    Ignore,
    /// Bounded by the entry's max_attempts, counted across the retry chain.
    Retry,
    MarkFailed,
    ManualIntervention,
    Rollback(RollbackStrategy),
}

/// One row of the per-plan failure-strategy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureStrategyEntry {
    pub pattern: FailurePattern,
    pub action: StrategyAction,
    /// Only consulted for Retry.
    pub max_attempts: u32,
}

impl FailureStrategyEntry {
    pub fn new(pattern: FailurePattern, action: StrategyAction, max_attempts: u32) -> Self {
        Self {
            pattern,
            action,
            max_attempts,
        }
    }
}

/// Ordered failure-strategy configuration, supplied externally per plan and
/// treated as read-only input by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureStrategyConfig {
    entries: Vec<FailureStrategyEntry>,
}

impl FailureStrategyConfig {
    pub fn new(entries: Vec<FailureStrategyEntry>) -> Self {
        Self { entries }
    }

    /// Entries matching `failure_type`, most specific first, declaration
    /// order breaking ties.
    pub fn matching(&self, failure_type: FailureType) -> Vec<&FailureStrategyEntry> {
        let mut hits: Vec<(usize, &FailureStrategyEntry)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.pattern.matches(failure_type))
            .collect();
        hits.sort_by(|(ia, a), (ib, b)| {
            b.pattern
                .specificity()
                .cmp(&a.pattern.specificity())
                .then(ia.cmp(ib))
        });
        hits.into_iter().map(|(_, e)| e).collect()
    }
}

impl Default for FailureStrategyConfig {
    /// Wildcard MarkFailed: any unmatched failure fails the node.
    fn default() -> Self {
        Self::new(vec![FailureStrategyEntry::new(
            FailurePattern::Wildcard,
            StrategyAction::MarkFailed,
            0,
        )])
    }
}

/// The user-visible record of why an execution concluded the way it did:
/// the triggering failure type plus the strategy that was exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub failure_type: FailureType,
    pub message: String,
    pub exhausted_strategy: Option<StrategyAction>,
}

/// The decided next action after a step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdviceAction {
    Proceed,
    Retry,
    MarkFailed,
    MarkSuccess,
    ManualIntervention,
    Rollback(RollbackStrategy),
}

/// Transient decision object; computed fresh on every transition, never
/// persisted beyond it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceOutcome {
    pub action: AdviceAction,
    pub next_node_id: Option<String>,
    pub retry_count: u32,
    pub failure: Option<FailureInfo>,
}

impl AdviceOutcome {
    pub fn proceed(next_node_id: Option<String>) -> Self {
        Self {
            action: AdviceAction::Proceed,
            next_node_id,
            retry_count: 0,
            failure: None,
        }
    }

    pub fn mark_success() -> Self {
        Self {
            action: AdviceAction::MarkSuccess,
            next_node_id: None,
            retry_count: 0,
            failure: None,
        }
    }

    pub fn mark_failed(failure: Option<FailureInfo>) -> Self {
        Self {
            action: AdviceAction::MarkFailed,
            next_node_id: None,
            retry_count: 0,
            failure,
        }
    }
}
