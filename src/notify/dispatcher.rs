use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Applies a batch of status-update messages to the in-memory execution
/// graph. Implemented by the visualization layer; out of scope here.
#[async_trait]
pub trait GraphUpdateService: Send + Sync {
    async fn update(&self, plan_execution_id: &str, message_ids: &[String]) -> anyhow::Result<()>;
}

/// Per-message acknowledgment back to the upstream event queue. A message
/// that is not acked gets redelivered.
#[async_trait]
pub trait AckSink: Send + Sync {
    async fn ack(&self, message_id: &str);
}

/// A status-update message pulled off the event queue.
#[derive(Debug, Clone)]
pub struct StatusUpdateMessage {
    pub message_id: String,
    pub plan_execution_id: String,
    pub received_at: DateTime<Utc>,
}

/// Flushes batches of graph updates and acknowledges them.
///
/// On update failure the last message of the batch is withheld from
/// acknowledgment so the queue redelivers it and drives a retry; the rest
/// are acked, trading a little duplicate processing for forward progress.
pub struct GraphUpdateDispatcher {
    service: Arc<dyn GraphUpdateService>,
    acks: Arc<dyn AckSink>,
    lag_warn_threshold: Duration,
}

impl GraphUpdateDispatcher {
    pub const DEFAULT_LAG_WARN: Duration = Duration::from_millis(100);

    pub fn new(service: Arc<dyn GraphUpdateService>, acks: Arc<dyn AckSink>) -> Self {
        Self {
            service,
            acks,
            lag_warn_threshold: Self::DEFAULT_LAG_WARN,
        }
    }

    pub fn with_lag_warn_threshold(mut self, threshold: Duration) -> Self {
        self.lag_warn_threshold = threshold;
        self
    }

    pub async fn dispatch(
        &self,
        plan_execution_id: &str,
        start_ts: DateTime<Utc>,
        message_ids: Vec<String>,
    ) {
        if message_ids.is_empty() {
            return;
        }
        let lag = Utc::now()
            .signed_duration_since(start_ts)
            .to_std()
            .unwrap_or_default();
        if lag > self.lag_warn_threshold {
            warn!(
                plan_execution_id,
                lag_ms = lag.as_millis() as u64,
                "graph update delayed beyond threshold; scheduler may be starved"
            );
        }

        match self.service.update(plan_execution_id, &message_ids).await {
            Ok(()) => {
                for id in &message_ids {
                    self.acks.ack(id).await;
                }
                debug!(
                    plan_execution_id,
                    count = message_ids.len(),
                    "graph update batch acknowledged"
                );
            }
            Err(err) => {
                warn!(
                    plan_execution_id,
                    error = %err,
                    "graph update failed; withholding last message for redelivery"
                );
                for id in &message_ids[..message_ids.len() - 1] {
                    self.acks.ack(id).await;
                }
            }
        }
    }
}

/// Consumes status-update messages off a channel, groups them per plan
/// execution, and flushes through the dispatcher on size or interval.
pub struct ProgressNotifier {
    dispatcher: GraphUpdateDispatcher,
    rx: mpsc::Receiver<StatusUpdateMessage>,
    batch_size: usize,
    flush_interval: Duration,
}

impl ProgressNotifier {
    pub fn new(
        dispatcher: GraphUpdateDispatcher,
        rx: mpsc::Receiver<StatusUpdateMessage>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            dispatcher,
            rx,
            batch_size,
            flush_interval,
        }
    }

    pub async fn run(mut self) {
        let mut batches: HashMap<String, (DateTime<Utc>, Vec<String>)> = HashMap::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => {
                            let entry = batches
                                .entry(msg.plan_execution_id.clone())
                                .or_insert_with(|| (msg.received_at, Vec::new()));
                            entry.0 = entry.0.min(msg.received_at);
                            entry.1.push(msg.message_id);
                            if entry.1.len() >= self.batch_size {
                                if let Some((start_ts, ids)) = batches.remove(&msg.plan_execution_id) {
                                    self.dispatcher.dispatch(&msg.plan_execution_id, start_ts, ids).await;
                                }
                            }
                        }
                        None => {
                            // channel closed; flush what is left and stop
                            for (plan, (start_ts, ids)) in batches.drain() {
                                self.dispatcher.dispatch(&plan, start_ts, ids).await;
                            }
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    for (plan, (start_ts, ids)) in std::mem::take(&mut batches) {
                        self.dispatcher.dispatch(&plan, start_ts, ids).await;
                    }
                }
            }
        }
    }
}
