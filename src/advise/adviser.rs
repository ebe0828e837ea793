use tracing::{debug, warn};

use crate::advise::strategy::{
    AdviceAction, AdviceOutcome, FailureInfo, FailureStrategyConfig, StepResponse, StrategyAction,
};
use crate::execution::model::NodeExecution;
use crate::plan::Plan;

/// Computes the next action from a step outcome, the configured failure
/// strategies and the retry chain so far. Stateless; a fresh decision is
/// computed on every transition.
///
/// Decision errors are never propagated: anything that cannot be resolved
/// against the strategy table collapses to MarkFailed so the plan never
/// stalls silently.
#[derive(Debug, Default, Clone)]
pub struct Adviser;

impl Adviser {
    pub fn new() -> Self {
        Self
    }

    pub fn decide(
        &self,
        exec: &NodeExecution,
        response: &StepResponse,
        config: &FailureStrategyConfig,
        plan: &Plan,
    ) -> AdviceOutcome {
        match response {
            StepResponse::Success { .. } => {
                let next = plan
                    .next_nodes(&exec.node_id)
                    .first()
                    .map(|n| n.node_id().to_string());
                match next {
                    Some(next_node_id) => AdviceOutcome::proceed(Some(next_node_id)),
                    None => AdviceOutcome::mark_success(),
                }
            }
            StepResponse::Failure {
                failure_type,
                message,
            } => {
                let attempts_so_far = exec.retry_count();
                let mut last_exhausted: Option<StrategyAction> = None;
                for entry in config.matching(*failure_type) {
                    match entry.action {
                        StrategyAction::Retry => {
                            if attempts_so_far < entry.max_attempts {
                                debug!(
                                    node_execution_id = %exec.id,
                                    attempt = attempts_so_far + 1,
                                    max_attempts = entry.max_attempts,
                                    "retry advised"
                                );
                                return AdviceOutcome {
                                    action: AdviceAction::Retry,
                                    next_node_id: None,
                                    retry_count: attempts_so_far + 1,
                                    failure: Some(FailureInfo {
                                        failure_type: *failure_type,
                                        message: message.clone(),
                                        exhausted_strategy: None,
                                    }),
                                };
                            }
                            // bounded retries exhausted across the chain;
                            // fall through to the next declared strategy
                            last_exhausted = Some(StrategyAction::Retry);
                        }
                        StrategyAction::Ignore => {
                            let next = plan
                                .next_nodes(&exec.node_id)
                                .first()
                                .map(|n| n.node_id().to_string());
                            return AdviceOutcome {
                                action: AdviceAction::Proceed,
                                next_node_id: next,
                                retry_count: attempts_so_far,
                                failure: Some(FailureInfo {
                                    failure_type: *failure_type,
                                    message: message.clone(),
                                    exhausted_strategy: Some(StrategyAction::Ignore),
                                }),
                            };
                        }
                        StrategyAction::MarkFailed => {
                            return AdviceOutcome::mark_failed(Some(FailureInfo {
                                failure_type: *failure_type,
                                message: message.clone(),
                                exhausted_strategy: last_exhausted
                                    .or(Some(StrategyAction::MarkFailed)),
                            }));
                        }
                        StrategyAction::ManualIntervention => {
                            return AdviceOutcome {
                                action: AdviceAction::ManualIntervention,
                                next_node_id: None,
                                retry_count: attempts_so_far,
                                failure: Some(FailureInfo {
                                    failure_type: *failure_type,
                                    message: message.clone(),
                                    exhausted_strategy: Some(StrategyAction::ManualIntervention),
                                }),
                            };
                        }
                        StrategyAction::Rollback(strategy) => {
                            return AdviceOutcome {
                                action: AdviceAction::Rollback(strategy),
                                next_node_id: None,
                                retry_count: attempts_so_far,
                                failure: Some(FailureInfo {
                                    failure_type: *failure_type,
                                    message: message.clone(),
                                    exhausted_strategy: Some(StrategyAction::Rollback(strategy)),
                                }),
                            };
                        }
                    }
                }
                warn!(
                    node_execution_id = %exec.id,
                    ?failure_type,
                    "no strategy resolved the failure; marking failed"
                );
                AdviceOutcome::mark_failed(Some(FailureInfo {
                    failure_type: *failure_type,
                    message: message.clone(),
                    exhausted_strategy: last_exhausted,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advise::strategy::{FailurePattern, FailureStrategyEntry, FailureType};
    use crate::plan::{NodeInfo, PlanNode};

    fn plan() -> Plan {
        Plan::builder()
            .add_node(PlanNode::Step(NodeInfo::new(
                "n1", "build", "ShellScript", "pipe.s1",
            )))
            .add_node(PlanNode::Step(NodeInfo::new(
                "n2", "test", "ShellScript", "pipe.s1",
            )))
            .add_edge("n1", "n2")
            .build()
            .unwrap()
    }

    fn exec_with_retries(plan: &Plan, retries: usize) -> NodeExecution {
        let mut exec = NodeExecution::new("plan-1", plan.node("n1").unwrap(), None);
        for _ in 0..retries {
            exec = exec.next_attempt();
        }
        exec
    }

    fn connectivity_retry_config() -> FailureStrategyConfig {
        FailureStrategyConfig::new(vec![
            FailureStrategyEntry::new(
                FailurePattern::Exact(FailureType::Connectivity),
                StrategyAction::Retry,
                2,
            ),
            FailureStrategyEntry::new(FailurePattern::Wildcard, StrategyAction::MarkFailed, 0),
        ])
    }

    #[test]
    fn success_proceeds_to_next_node() {
        let plan = plan();
        let exec = exec_with_retries(&plan, 0);
        let outcome = Adviser::new().decide(&exec, &StepResponse::success(), &Default::default(), &plan);
        assert_eq!(outcome.action, AdviceAction::Proceed);
        assert_eq!(outcome.next_node_id.as_deref(), Some("n2"));
    }

    #[test]
    fn retries_bounded_across_the_chain() {
        let plan = plan();
        let config = connectivity_retry_config();
        let failure = StepResponse::failure(FailureType::Connectivity, "socket reset");
        let adviser = Adviser::new();

        // first two failures advise retry
        for retries in 0..2 {
            let exec = exec_with_retries(&plan, retries);
            let outcome = adviser.decide(&exec, &failure, &config, &plan);
            assert_eq!(outcome.action, AdviceAction::Retry, "attempt {}", retries + 1);
            assert_eq!(outcome.retry_count, retries as u32 + 1);
        }

        // third attempt falls through to the wildcard
        let exec = exec_with_retries(&plan, 2);
        let outcome = adviser.decide(&exec, &failure, &config, &plan);
        assert_eq!(outcome.action, AdviceAction::MarkFailed);
        let failure_info = outcome.failure.unwrap();
        assert_eq!(failure_info.failure_type, FailureType::Connectivity);
        assert_eq!(failure_info.exhausted_strategy, Some(StrategyAction::Retry));
    }

    #[test]
    fn ignore_behaves_as_proceed() {
        let plan = plan();
        let exec = exec_with_retries(&plan, 0);
        let config = FailureStrategyConfig::new(vec![FailureStrategyEntry::new(
            FailurePattern::Wildcard,
            StrategyAction::Ignore,
            0,
        )]);
        let outcome = Adviser::new().decide(
            &exec,
            &StepResponse::failure(FailureType::Application, "flaky assertion"),
            &config,
            &plan,
        );
        assert_eq!(outcome.action, AdviceAction::Proceed);
        assert_eq!(outcome.next_node_id.as_deref(), Some("n2"));
        assert!(outcome.failure.is_some());
    }

    #[test]
    fn empty_strategy_match_marks_failed() {
        let plan = plan();
        let exec = exec_with_retries(&plan, 0);
        let config = FailureStrategyConfig::new(vec![FailureStrategyEntry::new(
            FailurePattern::Exact(FailureType::Authentication),
            StrategyAction::Retry,
            1,
        )]);
        let outcome = Adviser::new().decide(
            &exec,
            &StepResponse::failure(FailureType::Verification, "verify failed"),
            &config,
            &plan,
        );
        assert_eq!(outcome.action, AdviceAction::MarkFailed);
    }

    #[test]
    fn rollback_strategy_is_surfaced() {
        let plan = plan();
        let exec = exec_with_retries(&plan, 0);
        let config = FailureStrategyConfig::new(vec![FailureStrategyEntry::new(
            FailurePattern::Wildcard,
            StrategyAction::Rollback(crate::advise::RollbackStrategy::Stage),
            0,
        )]);
        let outcome = Adviser::new().decide(
            &exec,
            &StepResponse::failure(FailureType::Application, "deploy failed"),
            &config,
            &plan,
        );
        assert_eq!(
            outcome.action,
            AdviceAction::Rollback(crate::advise::RollbackStrategy::Stage)
        );
    }
}
