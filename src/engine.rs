use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::advise::{
    AdviceAction, AdviceOutcome, Adviser, FailureInfo, FailureStrategyConfig, FailureType,
    RollbackStrategy, StepResponse,
};
use crate::error::{BatonError, Result};
use crate::execution::{
    ExecutionStatus, ExecutionStore, InterruptEffect, NodeExecution, StatusTracker,
};
use crate::interrupt::{Interrupt, InterruptIssuer, InterruptManager, InterruptType};
use crate::notify::StatusEvents;
use crate::plan::{Plan, PlanNode, SkipKind};
use crate::waitnotify::{ResumeCallback, WaitNotifyRegistry};

/// Hands work off to the external task execution system; the system is
/// expected to eventually call back with the correlation id.
#[async_trait]
pub trait TaskDispatch: Send + Sync {
    async fn dispatch(&self, correlation_id: &str, payload: Value) -> anyhow::Result<()>;
}

/// Explicit call context. Resumption happens on arbitrary tasks and hosts,
/// so nothing here is ever ambient.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub plan_execution_id: String,
    pub node_execution_id: String,
}

/// What the engine ended up doing with a step response.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    /// The adviser's decision was acted on.
    Advice(AdviceOutcome),
    /// A concurrent interrupt overrode the advice.
    Overridden { interrupt_type: InterruptType },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded attempts against collaborators (task dispatch) before the
    /// affected execution is failed.
    pub collaborator_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_multiplier: f64,
    pub expiry_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collaborator_attempts: 3,
            backoff_initial: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            expiry_sweep_interval: Duration::from_secs(5),
        }
    }
}

/// The plan-node state machine: drives step/stage execution, applies
/// interrupts, resumes asynchronous callbacks, and fans executions out
/// across the plan graph.
pub struct OrchestrationEngine {
    plan: Arc<Plan>,
    store: Arc<dyn ExecutionStore>,
    tracker: StatusTracker,
    interrupts: InterruptManager,
    wait: WaitNotifyRegistry,
    adviser: Adviser,
    strategies: FailureStrategyConfig,
    events: StatusEvents,
    dispatcher: Option<Arc<dyn TaskDispatch>>,
    /// Advice outcomes displaced by a Pause, keyed by node execution id.
    /// A later Resume replays the stashed outcome so the node concludes.
    paused: DashMap<String, AdviceOutcome>,
    config: EngineConfig,
}

impl OrchestrationEngine {
    pub fn new(
        plan: Arc<Plan>,
        store: Arc<dyn ExecutionStore>,
        strategies: FailureStrategyConfig,
        config: EngineConfig,
    ) -> Self {
        let events = StatusEvents::new(256);
        Self {
            tracker: StatusTracker::new(store.clone(), events.clone()),
            interrupts: InterruptManager::new(store.clone()),
            wait: WaitNotifyRegistry::new(),
            adviser: Adviser::new(),
            plan,
            store,
            strategies,
            events,
            dispatcher: None,
            paused: DashMap::new(),
            config,
        }
    }

    pub fn with_task_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatch>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn register_callback<S: Into<String>>(&self, kind: S, callback: Arc<dyn ResumeCallback>) {
        self.wait.register_callback(kind, callback);
    }

    pub fn events(&self) -> &StatusEvents {
        &self.events
    }

    pub fn interrupts(&self) -> &InterruptManager {
        &self.interrupts
    }

    pub async fn execution(&self, node_execution_id: &str) -> Result<NodeExecution> {
        self.store
            .get(node_execution_id)
            .await?
            .ok_or_else(|| BatonError::not_found("node_execution", node_execution_id))
    }

    /// Begins execution at a plan node: creates the execution record and
    /// walks skip/identity handling. Skipped and identity nodes conclude
    /// immediately and traversal continues to their successors; everything
    /// else is left Running for its step to report back via
    /// [`handle_step_response`](Self::handle_step_response) or a registered
    /// pending resume.
    ///
    /// A node that already has an active execution (fan-in from a fork) is
    /// left alone.
    pub async fn trigger_node(
        &self,
        plan_execution_id: &str,
        node_id: &str,
    ) -> Result<Vec<NodeExecution>> {
        self.trigger_node_from(plan_execution_id, node_id, None).await
    }

    /// Traversal worker behind [`trigger_node`](Self::trigger_node). Each
    /// created execution records the execution that fanned out to it as its
    /// parent; entry-point nodes have none.
    async fn trigger_node_from(
        &self,
        plan_execution_id: &str,
        node_id: &str,
        parent_id: Option<String>,
    ) -> Result<Vec<NodeExecution>> {
        if !self.plan.contains(node_id) {
            return Err(BatonError::not_found("plan_node", node_id));
        }
        let mut created = Vec::new();
        let mut worklist: VecDeque<(String, Option<String>)> =
            VecDeque::from([(node_id.to_string(), parent_id)]);
        while let Some((current_id, parent)) = worklist.pop_front() {
            let node = self
                .plan
                .node(&current_id)
                .ok_or_else(|| BatonError::not_found("plan_node", current_id.as_str()))?;

            if self
                .store
                .active_for_node(plan_execution_id, &current_id)
                .await?
                .is_some()
            {
                debug!(plan_execution_id, node_id = %current_id, "node already active; fan-in");
                continue;
            }

            let exec = NodeExecution::new(plan_execution_id, node, parent);
            self.store.create(&exec).await?;
            info!(plan_execution_id, node_id = %current_id, execution_id = %exec.id, "node queued");

            if node.should_skip() {
                self.tracker
                    .transition(&exec.id, ExecutionStatus::Skipped)
                    .await?;
                if node.skip_kind() != SkipKind::SkipTree {
                    for next in self.plan.next_nodes(&current_id) {
                        worklist.push_back((next.node_id().to_string(), Some(exec.id.clone())));
                    }
                }
            } else if let PlanNode::Identity {
                original_node_execution_id,
                ..
            } = node
            {
                let copied = self.copy_identity_result(&exec, original_node_execution_id).await?;
                if copied == ExecutionStatus::Succeeded {
                    for next in self.plan.next_nodes(&current_id) {
                        worklist.push_back((next.node_id().to_string(), Some(exec.id.clone())));
                    }
                }
            } else {
                self.tracker
                    .transition(&exec.id, ExecutionStatus::Running)
                    .await?;
            }
            created.push(self.execution(&exec.id).await?);
        }
        Ok(created)
    }

    /// Identity nodes short-circuit: the prior execution's terminal status
    /// is copied instead of re-running the work.
    async fn copy_identity_result(
        &self,
        exec: &NodeExecution,
        original_node_execution_id: &str,
    ) -> Result<ExecutionStatus> {
        let target = match self.store.get(original_node_execution_id).await? {
            Some(original) if original.status.is_terminal() => original.status,
            Some(original) => {
                warn!(
                    original_id = %original.id,
                    status = ?original.status,
                    "identity target not terminal; failing the copy"
                );
                ExecutionStatus::Failed
            }
            None => {
                warn!(
                    original_id = original_node_execution_id,
                    "identity target missing; failing the copy"
                );
                ExecutionStatus::Failed
            }
        };
        self.tracker.transition(&exec.id, target).await?;
        Ok(target)
    }

    /// Registers a pending resume for a running execution and hands the
    /// correlated payload to the external task system. The execution moves
    /// to AsyncWaiting; no thread blocks.
    pub async fn suspend_for_task(
        &self,
        ctx: &ExecContext,
        callback_kind: &str,
        timeout: Duration,
        payload: Value,
    ) -> Result<String> {
        let exec = self.execution(&ctx.node_execution_id).await?;
        if exec.status != ExecutionStatus::Running {
            return Err(BatonError::invalid_state(
                "node_execution",
                exec.id.clone(),
                format!("cannot suspend from {:?}", exec.status),
            ));
        }
        let correlation_id =
            self.wait
                .await_external(&ctx.node_execution_id, callback_kind, timeout)?;

        if let Some(dispatcher) = &self.dispatcher {
            if let Err(err) = self
                .dispatch_with_backoff(dispatcher, &correlation_id, payload)
                .await
            {
                // undo the suspension and fail the node
                self.wait.discontinue(&ctx.node_execution_id);
                self.fail_execution(
                    &ctx.node_execution_id,
                    FailureInfo {
                        failure_type: FailureType::Connectivity,
                        message: err.to_string(),
                        exhausted_strategy: None,
                    },
                )
                .await?;
                return Err(err);
            }
        }
        self.tracker
            .transition(&ctx.node_execution_id, ExecutionStatus::AsyncWaiting)
            .await?;
        Ok(correlation_id)
    }

    async fn dispatch_with_backoff(
        &self,
        dispatcher: &Arc<dyn TaskDispatch>,
        correlation_id: &str,
        payload: Value,
    ) -> Result<()> {
        let mut delay = self.config.backoff_initial;
        let mut last_err = String::new();
        for attempt in 1..=self.config.collaborator_attempts {
            match dispatcher.dispatch(correlation_id, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        correlation_id,
                        attempt,
                        error = %err,
                        "task dispatch attempt failed"
                    );
                    last_err = err.to_string();
                }
            }
            if attempt < self.config.collaborator_attempts {
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(
                    delay.as_secs_f64() * self.config.backoff_multiplier,
                );
            }
        }
        Err(BatonError::TaskDispatch { message: last_err })
    }

    /// External entry point for the at-least-once response transport.
    /// Consumed or unknown correlations are a no-op.
    pub async fn resolve(
        &self,
        correlation_id: &str,
        payload: Value,
    ) -> Result<Option<AdviceOutcome>> {
        let Some(resumption) = self.wait.resolve(correlation_id, payload).await? else {
            return Ok(None);
        };
        let node_execution_id = resumption.record.node_execution_id.clone();
        // wake the node; a rejection means something terminal (abort) landed
        // between the registry removal and this point
        let woke = self
            .tracker
            .transition(&node_execution_id, ExecutionStatus::Running)
            .await?;
        if !woke.is_applied() {
            return Ok(None);
        }
        let outcome = self
            .conclude(&node_execution_id, resumption.outcome)
            .await?;
        Ok(match outcome {
            EngineOutcome::Advice(advice) => Some(advice),
            EngineOutcome::Overridden { .. } => None,
        })
    }

    /// Synchronous step completion: computes advice, lets a concurrent
    /// interrupt override it, then acts.
    pub async fn handle_step_response(
        &self,
        node_execution_id: &str,
        response: StepResponse,
    ) -> Result<EngineOutcome> {
        let exec = self.execution(node_execution_id).await?;
        let outcome = self
            .adviser
            .decide(&exec, &response, &self.strategies, &self.plan);
        self.conclude(node_execution_id, outcome).await
    }

    /// Applies any pending interrupt, falling back to the advice outcome.
    async fn conclude(
        &self,
        node_execution_id: &str,
        outcome: AdviceOutcome,
    ) -> Result<EngineOutcome> {
        if let Some(interrupt) = self.interrupts.apply(node_execution_id).await {
            info!(
                node_execution_id,
                interrupt_type = ?interrupt.interrupt_type,
                "interrupt overrides advice"
            );
            if interrupt.interrupt_type == InterruptType::Pause {
                // stash the displaced outcome; a Resume replays it
                self.paused
                    .insert(node_execution_id.to_string(), outcome);
            }
            let applied = self.perform_interrupt(&interrupt).await;
            self.interrupts.mark_processed(&interrupt.id, applied.is_ok());
            applied?;
            return Ok(EngineOutcome::Overridden {
                interrupt_type: interrupt.interrupt_type,
            });
        }
        self.act_on_advice(node_execution_id, &outcome).await?;
        Ok(EngineOutcome::Advice(outcome))
    }

    async fn act_on_advice(&self, node_execution_id: &str, outcome: &AdviceOutcome) -> Result<()> {
        let exec = self.execution(node_execution_id).await?;
        match outcome.action {
            AdviceAction::Proceed => {
                if let Some(failure) = &outcome.failure {
                    // ignored failure: record it, then continue
                    self.record_failure(&exec, failure.clone()).await?;
                }
                self.tracker
                    .transition(node_execution_id, ExecutionStatus::Succeeded)
                    .await?;
                for next in self.plan.next_nodes(&exec.node_id) {
                    self.trigger_node_from(
                        &exec.plan_execution_id,
                        next.node_id(),
                        Some(exec.id.clone()),
                    )
                    .await?;
                }
            }
            AdviceAction::MarkSuccess => {
                self.tracker
                    .transition(node_execution_id, ExecutionStatus::Succeeded)
                    .await?;
            }
            AdviceAction::Retry => {
                if let Some(failure) = &outcome.failure {
                    self.record_failure(&exec, failure.clone()).await?;
                }
                self.tracker
                    .transition(node_execution_id, ExecutionStatus::Failed)
                    .await?;
                let successor = self.interrupts.retry_execution(node_execution_id).await?;
                self.tracker
                    .transition(&successor.id, ExecutionStatus::Running)
                    .await?;
            }
            AdviceAction::MarkFailed => {
                self.fail_execution(
                    node_execution_id,
                    outcome.failure.clone().unwrap_or(FailureInfo {
                        failure_type: FailureType::Unknown,
                        message: "step failed".to_string(),
                        exhausted_strategy: None,
                    }),
                )
                .await?;
            }
            AdviceAction::ManualIntervention => {
                if let Some(failure) = &outcome.failure {
                    self.record_failure(&exec, failure.clone()).await?;
                }
                self.tracker
                    .transition(node_execution_id, ExecutionStatus::InterventionWaiting)
                    .await?;
            }
            AdviceAction::Rollback(strategy) => {
                self.fail_execution(
                    node_execution_id,
                    outcome.failure.clone().unwrap_or(FailureInfo {
                        failure_type: FailureType::Unknown,
                        message: "rollback triggered".to_string(),
                        exhausted_strategy: None,
                    }),
                )
                .await?;
                self.trigger_rollback(&exec, strategy).await?;
            }
        }
        Ok(())
    }

    /// Rollback-stage traversal: resolves target stages per the strategy and
    /// triggers their rollback subgraphs.
    async fn trigger_rollback(&self, exec: &NodeExecution, strategy: RollbackStrategy) -> Result<()> {
        let stages = self.plan.stages();
        let current_pos = stages
            .iter()
            .position(|s| s.info().stage_fqn == exec.stage_fqn);
        let targets: Vec<&PlanNode> = match (strategy, current_pos) {
            (RollbackStrategy::Stage, Some(pos)) => vec![stages[pos]],
            (RollbackStrategy::PriorStage, Some(pos)) if pos > 0 => vec![stages[pos - 1]],
            (RollbackStrategy::PriorStage, _) => Vec::new(),
            (RollbackStrategy::Pipeline, Some(pos)) => {
                stages[..=pos].iter().rev().copied().collect()
            }
            (_, None) => Vec::new(),
        };
        for stage in targets {
            let Some(rollback_node_id) = &stage.info().rollback_node_id else {
                debug!(stage = %stage.node_id(), "stage has no rollback subgraph");
                continue;
            };
            info!(
                stage = %stage.node_id(),
                rollback_node_id,
                "triggering rollback stage"
            );
            self.trigger_node_from(&exec.plan_execution_id, rollback_node_id, Some(exec.id.clone()))
                .await?;
        }
        Ok(())
    }

    async fn record_failure(&self, exec: &NodeExecution, failure: FailureInfo) -> Result<()> {
        let mut updated = self.execution(&exec.id).await?;
        updated.failure_info = Some(failure);
        self.store.save(&updated).await
    }

    async fn fail_execution(&self, node_execution_id: &str, failure: FailureInfo) -> Result<()> {
        let mut exec = self.execution(node_execution_id).await?;
        exec.failure_info = Some(failure);
        self.store.save(&exec).await?;
        self.tracker
            .transition(node_execution_id, ExecutionStatus::Failed)
            .await?;
        Ok(())
    }

    /// Registers an interrupt and, for the eagerly-applied kinds (aborts,
    /// retries, expiry, resume), performs it immediately. Pause stays queued
    /// and is picked up by [`apply`](InterruptManager::apply) on the next
    /// advice boundary, where it stashes the advice it displaces.
    pub async fn register_interrupt(
        &self,
        plan_execution_id: &str,
        node_execution_id: Option<String>,
        interrupt_type: InterruptType,
        issued_by: InterruptIssuer,
        group: Vec<String>,
    ) -> Result<InterruptEffect> {
        let interrupt = Interrupt::new(
            plan_execution_id.to_string(),
            node_execution_id,
            interrupt_type,
            issued_by,
        )
        .with_group(group);
        let effect = self.interrupts.register(interrupt).await?;

        let Some(registered) = self.interrupts.get(&effect.interrupt_id) else {
            return Ok(effect);
        };
        if !registered.is_unprocessed() {
            // plan-level wrap-up race; already marked unsuccessful
            return Ok(effect);
        }
        match interrupt_type {
            InterruptType::Pause => {}
            _ => {
                let applied = self.perform_interrupt(&registered).await;
                self.interrupts
                    .mark_processed(&registered.id, applied.is_ok());
                applied?;
            }
        }
        Ok(effect)
    }

    async fn perform_interrupt(&self, interrupt: &Interrupt) -> Result<()> {
        match interrupt.interrupt_type {
            InterruptType::AbortAll => {
                let active = self
                    .store
                    .active_for_plan(&interrupt.plan_execution_id)
                    .await?;
                for exec in active {
                    self.discontinue_and_conclude(&exec.id, interrupt, ExecutionStatus::Aborted)
                        .await?;
                }
                Ok(())
            }
            InterruptType::Abort => {
                let target = interrupt.node_execution_id.as_deref().ok_or_else(|| {
                    BatonError::invalid_state(
                        "interrupt",
                        interrupt.id.clone(),
                        "abort without target".to_string(),
                    )
                })?;
                self.discontinue_and_conclude(target, interrupt, ExecutionStatus::Aborted)
                    .await
            }
            InterruptType::Expire => {
                let target = interrupt.node_execution_id.as_deref().ok_or_else(|| {
                    BatonError::invalid_state(
                        "interrupt",
                        interrupt.id.clone(),
                        "expire without target".to_string(),
                    )
                })?;
                self.discontinue_and_conclude(target, interrupt, ExecutionStatus::Expired)
                    .await
            }
            InterruptType::Retry => {
                let target = interrupt.node_execution_id.as_deref().ok_or_else(|| {
                    BatonError::invalid_state(
                        "interrupt",
                        interrupt.id.clone(),
                        "retry without target".to_string(),
                    )
                })?;
                self.record_effect(target, interrupt).await?;
                self.interrupts.retry_execution(target).await?;
                Ok(())
            }
            InterruptType::RetryStepGroup => {
                self.interrupts.retry_step_group(&interrupt.group).await?;
                for member in &interrupt.group {
                    self.record_effect(member, interrupt).await?;
                }
                Ok(())
            }
            InterruptType::Pause => {
                // recorded only; conclude() has already stashed the advice
                if let Some(target) = interrupt.node_execution_id.as_deref() {
                    self.record_effect(target, interrupt).await?;
                }
                Ok(())
            }
            InterruptType::Resume => {
                let target = interrupt.node_execution_id.as_deref().ok_or_else(|| {
                    BatonError::invalid_state(
                        "interrupt",
                        interrupt.id.clone(),
                        "resume without target".to_string(),
                    )
                })?;
                self.record_effect(target, interrupt).await?;
                // a pause that never reached an advice boundary is simply
                // withdrawn
                self.interrupts.cancel_pending_pause(target);
                if let Some((_, displaced)) = self.paused.remove(target) {
                    info!(
                        node_execution_id = %target,
                        "resume replays the advice displaced by pause"
                    );
                    self.act_on_advice(target, &displaced).await?;
                }
                Ok(())
            }
        }
    }

    /// Consumes any pending resume for the node (making a late resolve a
    /// no-op), records the interrupt effect and moves the node to its final
    /// status.
    async fn discontinue_and_conclude(
        &self,
        node_execution_id: &str,
        interrupt: &Interrupt,
        final_status: ExecutionStatus,
    ) -> Result<()> {
        self.wait.discontinue(node_execution_id);
        // a stashed pause outcome dies with the execution
        self.paused.remove(node_execution_id);
        self.record_effect(node_execution_id, interrupt).await?;
        self.tracker
            .transition(node_execution_id, final_status)
            .await?;
        Ok(())
    }

    async fn record_effect(&self, node_execution_id: &str, interrupt: &Interrupt) -> Result<()> {
        let mut exec = self.execution(node_execution_id).await?;
        exec.interrupt_history.push(InterruptEffect {
            interrupt_id: interrupt.id.clone(),
            interrupt_type: interrupt.interrupt_type,
            took_effect_at: Utc::now(),
        });
        self.store.save(&exec).await
    }

    /// Spawns the periodic expiry sweep. Every pending resume past its
    /// expiry is consumed (single winner against concurrent resolves) and
    /// its node moved to Expired.
    pub fn spawn_expiry_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.expiry_sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.sweep_expired_once().await;
            }
        })
    }

    /// One expiry pass; exposed for deterministic tests.
    pub async fn sweep_expired_once(&self) {
        for record in self.wait.sweep_expired(Utc::now()) {
            let node_execution_id = record.node_execution_id.clone();
            let fail = FailureInfo {
                failure_type: FailureType::Timeout,
                message: format!(
                    "no response for correlation '{}' before expiry",
                    record.correlation_id
                ),
                exhausted_strategy: None,
            };
            let result: Result<()> = async {
                let mut exec = self.execution(&node_execution_id).await?;
                exec.failure_info = Some(fail);
                self.store.save(&exec).await?;
                self.tracker
                    .transition(&node_execution_id, ExecutionStatus::Expired)
                    .await?;
                Ok(())
            }
            .await;
            if let Err(err) = result {
                warn!(
                    node_execution_id = %node_execution_id,
                    error = %err,
                    "failed to expire suspended execution"
                );
            }
        }
    }
}
