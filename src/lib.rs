//! Baton - a plan-node state machine for pipeline orchestration.
//!
//! Drives step/stage execution across a static plan DAG, handles interrupts
//! (abort, retry, retry-step-group), resumes asynchronous callbacks through
//! a correlation-id wait registry, and publishes incremental execution-graph
//! updates.

// Core infrastructure
pub mod error;

// Engine building blocks
pub mod advise; // failure strategies and advice computation
pub mod execution; // node execution records, status machine, stores
pub mod interrupt; // control signals against running executions
pub mod notify; // status events and graph-update batching
pub mod plan; // the static plan DAG
pub mod waitnotify; // correlation registry for async resumes

// The orchestration core tying them together
pub mod engine;

// Re-exports for convenience
pub use advise::{
    AdviceAction, AdviceOutcome, Adviser, FailureInfo, FailurePattern, FailureStrategyConfig,
    FailureStrategyEntry, FailureType, RollbackStrategy, StepResponse, StrategyAction,
};
pub use engine::{EngineConfig, EngineOutcome, ExecContext, OrchestrationEngine, TaskDispatch};
pub use error::{BatonError, Result};
pub use execution::{
    ExecutionStatus, ExecutionStore, InMemoryStore, InterruptEffect, NodeExecution, SledStore,
    StatusTracker, Transition,
};
pub use interrupt::{Interrupt, InterruptIssuer, InterruptManager, InterruptState, InterruptType};
pub use notify::{GraphUpdateDispatcher, ProgressNotifier, StatusEvent, StatusEvents};
pub use plan::{NodeInfo, Plan, PlanBuilder, PlanNode, SkipKind};
pub use waitnotify::{PendingResume, ResumeCallback, WaitNotifyRegistry};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn engine_runs_a_linear_plan_end_to_end() {
        let plan = Arc::new(
            Plan::builder()
                .add_node(PlanNode::Stage(NodeInfo::new(
                    "stage1",
                    "build stage",
                    "Stage",
                    "pipe.s1",
                )))
                .add_node(PlanNode::Step(NodeInfo::new(
                    "build",
                    "build",
                    "ShellScript",
                    "pipe.s1",
                )))
                .add_edge("stage1", "build")
                .build()
                .unwrap(),
        );
        let store = Arc::new(InMemoryStore::new());
        let engine = OrchestrationEngine::new(
            plan,
            store.clone(),
            FailureStrategyConfig::default(),
            EngineConfig::default(),
        );

        let started = engine.trigger_node("plan-1", "stage1").await.unwrap();
        assert_eq!(started.len(), 1);
        let stage_exec = &started[0];
        assert_eq!(stage_exec.status, ExecutionStatus::Running);

        // stage succeeds, traversal reaches the step
        engine
            .handle_step_response(&stage_exec.id, StepResponse::success())
            .await
            .unwrap();
        let step_exec = store
            .active_for_node("plan-1", "build")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step_exec.status, ExecutionStatus::Running);

        // step succeeds, plan is done
        engine
            .handle_step_response(&step_exec.id, StepResponse::success())
            .await
            .unwrap();
        assert!(store.active_for_plan("plan-1").await.unwrap().is_empty());
    }
}
