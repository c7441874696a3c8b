//! Run event log and broadcast observability.
//!
//! Every status transition is recorded under a single per-run logical clock
//! (`seq`) so concurrent completions still produce one total order. External
//! observers subscribe through a [`tokio::sync::broadcast`] channel and never
//! couple to scheduler internals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cascade_types::{StepKey, StepStatus};

/// One entry of a run's append-only outcome log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Position under the run's logical clock; strictly increasing.
    pub seq: u64,
    pub step: StepKey,
    pub status: StepStatus,
    pub at: DateTime<Utc>,
}

/// Events emitted during plan compilation and execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
        step_count: usize,
    },
    StepTransition {
        run_id: Uuid,
        event: RunEvent,
    },
    DynamicExpanded {
        run_id: Uuid,
        producer: StepKey,
        output: String,
        new_steps: Vec<StepKey>,
    },
    RunCompleted {
        run_id: Uuid,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    RunCancelled {
        run_id: Uuid,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
