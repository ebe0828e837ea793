use chrono::{DateTime, Utc};

use crate::execution::model::ExecutionStatus;

/// A node status transition, published after the store write lands.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub plan_execution_id: String,
    pub node_execution_id: String,
    pub node_id: String,
    pub from: Option<ExecutionStatus>,
    pub to: ExecutionStatus,
    pub at: DateTime<Utc>,
}

/// Broadcast bus for status events. Publishing never blocks: the channel is
/// in overflow mode, and slow subscribers lose the oldest events rather than
/// stalling the engine.
#[derive(Clone)]
pub struct StatusEvents {
    tx: async_broadcast::Sender<StatusEvent>,
    keep: async_broadcast::InactiveReceiver<StatusEvent>,
}

impl StatusEvents {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity);
        tx.set_overflow(true);
        Self {
            tx,
            keep: rx.deactivate(),
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<StatusEvent> {
        self.keep.activate_cloned()
    }

    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.try_broadcast(event);
    }
}
