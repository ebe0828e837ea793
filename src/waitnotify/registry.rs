use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::advise::AdviceOutcome;
use crate::error::{BatonError, Result};

/// Correlation record for a node execution suspended on external work.
/// Single-use: exactly one resume consumes it, or the expiry sweep drops it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResume {
    pub correlation_id: String,
    pub node_execution_id: String,
    pub callback_kind: String,
    pub registered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Resume strategy, keyed by callback kind. Translates the external response
/// payload into an advice outcome for the waiting node.
#[async_trait]
pub trait ResumeCallback: Send + Sync {
    async fn on_response(
        &self,
        node_execution_id: &str,
        payload: Value,
    ) -> anyhow::Result<AdviceOutcome>;
}

/// A consumed correlation together with the outcome its callback computed.
#[derive(Debug, Clone)]
pub struct Resumption {
    pub record: PendingResume,
    pub outcome: AdviceOutcome,
}

/// Wait registry keyed by correlation id.
///
/// Suspension is logical, not thread-blocking: the execution thread returns
/// right after registering, and resumption happens on whatever task later
/// calls [`resolve`](WaitNotifyRegistry::resolve). Concurrent `resolve` and
/// expiry-sweep races on the same correlation are decided by the atomic map
/// removal: first to delete the record wins, the other path is a no-op.
pub struct WaitNotifyRegistry {
    pending: DashMap<String, PendingResume>,
    by_node: DashMap<String, String>,
    callbacks: DashMap<String, Arc<dyn ResumeCallback>>,
}

impl WaitNotifyRegistry {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            by_node: DashMap::new(),
            callbacks: DashMap::new(),
        }
    }

    pub fn register_callback<S: Into<String>>(&self, kind: S, callback: Arc<dyn ResumeCallback>) {
        self.callbacks.insert(kind.into(), callback);
    }

    /// Registers a pending resume and returns the correlation id to hand to
    /// the external system. The caller is freed immediately.
    pub fn await_external(
        &self,
        node_execution_id: &str,
        callback_kind: &str,
        timeout: Duration,
    ) -> Result<String> {
        if !self.callbacks.contains_key(callback_kind) {
            return Err(BatonError::invalid_state(
                "resume_callback",
                callback_kind.to_string(),
                "unknown callback kind".to_string(),
            ));
        }
        let now = Utc::now();
        let record = PendingResume {
            correlation_id: cuid2::create_id(),
            node_execution_id: node_execution_id.to_string(),
            callback_kind: callback_kind.to_string(),
            registered_at: now,
            expires_at: now
                + chrono::Duration::from_std(timeout)
                    .unwrap_or_else(|_| chrono::Duration::days(365)),
        };
        let correlation_id = record.correlation_id.clone();
        self.by_node
            .insert(node_execution_id.to_string(), correlation_id.clone());
        self.pending.insert(correlation_id.clone(), record);
        debug!(
            node_execution_id,
            correlation_id, callback_kind, "pending resume registered"
        );
        Ok(correlation_id)
    }

    /// Consumes the correlation and dispatches the payload to its callback.
    ///
    /// Absent correlations (already consumed or expired) are a logged no-op
    /// returning `None`; external transports deliver at least once, so
    /// duplicates are expected. Callback errors resolve to MarkFailed advice
    /// rather than propagating, so the plan never stalls.
    pub async fn resolve(&self, correlation_id: &str, payload: Value) -> Result<Option<Resumption>> {
        let Some((_, record)) = self.pending.remove(correlation_id) else {
            warn!(
                correlation_id,
                "resolve for consumed or unknown correlation; dropping"
            );
            return Ok(None);
        };
        self.by_node
            .remove_if(&record.node_execution_id, |_, c| c.as_str() == correlation_id);

        let Some(callback) = self
            .callbacks
            .get(&record.callback_kind)
            .map(|c| c.clone())
        else {
            warn!(
                correlation_id,
                callback_kind = %record.callback_kind,
                "no callback registered for kind; marking failed"
            );
            return Ok(Some(Resumption {
                record,
                outcome: AdviceOutcome::mark_failed(None),
            }));
        };

        let outcome = match callback
            .on_response(&record.node_execution_id, payload)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    correlation_id,
                    error = %err,
                    "resume callback failed; marking failed"
                );
                AdviceOutcome::mark_failed(None)
            }
        };
        info!(
            correlation_id,
            node_execution_id = %record.node_execution_id,
            "pending resume consumed"
        );
        Ok(Some(Resumption { record, outcome }))
    }

    /// Consumes any outstanding correlation for a node without invoking its
    /// callback. Used when an abort lands on a suspended node: the late
    /// external response then finds nothing to resume.
    pub fn discontinue(&self, node_execution_id: &str) -> Option<PendingResume> {
        let (_, correlation_id) = self.by_node.remove(node_execution_id)?;
        let removed = self.pending.remove(&correlation_id).map(|(_, r)| r);
        if removed.is_some() {
            info!(
                node_execution_id,
                correlation_id, "pending resume discontinued"
            );
        }
        removed
    }

    /// Removes and returns every record past expiry. Each removal is atomic,
    /// so a sweep racing a legitimate `resolve` on the same correlation
    /// yields exactly one winner.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<PendingResume> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.correlation_id.clone())
            .collect();
        let mut out = Vec::new();
        for correlation_id in expired {
            if let Some((_, record)) = self.pending.remove(&correlation_id) {
                self.by_node
                    .remove_if(&record.node_execution_id, |_, c| c.as_str() == correlation_id);
                warn!(
                    correlation_id,
                    node_execution_id = %record.node_execution_id,
                    "pending resume expired"
                );
                out.push(record);
            }
        }
        out
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for WaitNotifyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
