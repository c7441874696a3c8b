//! Durable record of one finished run.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cascade_types::{SkipReason, StepKey, StepStatus};

use crate::events::RunEvent;
use crate::plan::ExecutionPlan;

/// Everything a later re-execution needs from a run: the plan as it stood
/// after any dynamic expansion, the final outcome set, the emitted output
/// names per step, and the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub plan: ExecutionPlan,
    pub statuses: BTreeMap<StepKey, StepStatus>,
    pub emitted: BTreeMap<StepKey, BTreeSet<String>>,
    pub events: Vec<RunEvent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn status(&self, key: &str) -> Option<StepStatus> {
        self.statuses.get(key).copied()
    }

    /// Whether the run finished cleanly: no step failed and none were swept
    /// by a cancellation.
    pub fn succeeded(&self) -> bool {
        !self.statuses.values().any(|s| {
            matches!(
                s,
                StepStatus::Failed | StepStatus::Skipped(SkipReason::Cancelled)
            )
        })
    }

    /// Steps that went wrong: failures plus the skips they caused.
    pub fn failure_roots(&self) -> BTreeSet<StepKey> {
        self.statuses
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s,
                    StepStatus::Failed | StepStatus::Skipped(SkipReason::UpstreamFailure)
                )
            })
            .map(|(k, _)| k.clone())
            .collect()
    }
}
