//! Derives a child plan from a finished run: which steps execute afresh and
//! which replay the parent's artifacts.

use std::collections::BTreeSet;

use tracing::debug;

use cascade_types::{CascadeError, Result, StepKey, StepStatus};

use crate::collaborators::ArtifactStore;
use crate::plan::{ExecutionPlan, StepInputSource, StepSource};
use crate::run::RunRecord;
use crate::selection::select;

/// Which subset of the parent's steps a re-execution computes afresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReexecutionMode {
    /// Everything runs again; nothing is reused.
    All,
    /// Exactly the selected steps.
    Selected,
    /// The selected steps plus their transitive data descendants.
    FromSelected,
    /// Failed steps, the skips those failures caused, and everything
    /// downstream of either.
    FromFailure,
}

impl ReexecutionMode {
    fn needs_selection(self) -> bool {
        matches!(self, ReexecutionMode::Selected | ReexecutionMode::FromSelected)
    }
}

/// Plan a child run of `parent`.
///
/// Steps outside the fresh set that succeeded in the parent are marked
/// reused, carrying the provenance of wherever their artifacts actually live
/// (reuse chains collapse to the originating run). Steps that did not
/// succeed stay fresh so their outcome is re-derived. Fresh dynamic
/// producers have their parent expansion collapsed back to templates, since
/// the new execution may yield different mapping keys.
pub fn plan_reexecution(
    parent: &RunRecord,
    mode: ReexecutionMode,
    selection: Option<&str>,
) -> Result<ExecutionPlan> {
    let mut plan = parent.plan.clone();

    if mode.needs_selection() && selection.is_none() {
        return Err(CascadeError::Other(format!(
            "re-execution mode {mode:?} requires a selection query"
        )));
    }

    let mut fresh: BTreeSet<StepKey> = match mode {
        ReexecutionMode::All => plan.live_steps().map(|s| s.key.clone()).collect(),
        ReexecutionMode::Selected => select(&plan, selection.unwrap_or_default())?,
        ReexecutionMode::FromSelected => {
            let roots = select(&plan, selection.unwrap_or_default())?;
            let mut set = roots.clone();
            for root in &roots {
                set.extend(plan.downstream_of(root));
            }
            set
        }
        ReexecutionMode::FromFailure => {
            let roots = parent.failure_roots();
            let mut set = roots.clone();
            for root in &roots {
                set.extend(plan.downstream_of(root));
            }
            set
        }
    };

    // A fresh clone implies a fresh collect join downstream, and vice versa
    // the join rereads only fresh members; clones keep their keys, so the
    // expansion stays in place. Only a fresh *producer* invalidates keys.
    let collapse: BTreeSet<StepKey> = plan
        .steps
        .values()
        .filter(|s| s.has_dynamic_output() && fresh.contains(&s.key))
        .map(|s| s.key.clone())
        .collect();

    for step in plan.steps.values_mut() {
        if fresh.contains(&step.key) {
            step.source = StepSource::Fresh;
            continue;
        }
        if parent.status(&step.key) == Some(StepStatus::Succeeded) {
            let (run_id, source_step) = match &step.source {
                StepSource::Reused { run_id, step, .. } => (*run_id, step.clone()),
                StepSource::Fresh => (parent.run_id, step.key.clone()),
            };
            let outputs = parent.emitted.get(&step.key).cloned().unwrap_or_default();
            step.source = StepSource::Reused {
                run_id,
                step: source_step,
                outputs,
            };
        } else {
            // Failed or skipped in the parent and not selected: no artifact
            // to replay, so the outcome is re-derived this run.
            step.source = StepSource::Fresh;
        }
    }

    for producer in &collapse {
        collapse_expansion(&mut plan, producer);
        // The collapsed templates will re-expand with the new keys; they are
        // fresh by construction.
        fresh.extend(
            plan.steps
                .values()
                .filter(|s| s.template && s.mapping_root.as_deref() == Some(producer.as_str()))
                .map(|s| s.key.clone()),
        );
    }

    debug!(
        parent_run = %parent.run_id,
        ?mode,
        fresh = fresh.len(),
        "Planned re-execution"
    );
    Ok(plan)
}

/// Undo the parent's dynamic expansion for one producer: drop the clones,
/// revive the templates, and return the collect joins to pending.
fn collapse_expansion(plan: &mut ExecutionPlan, producer: &str) {
    let clones: Vec<StepKey> = plan
        .steps
        .values()
        .filter(|s| !s.template && s.mapping_root.as_deref() == Some(producer))
        .map(|s| s.key.clone())
        .collect();
    let templates: Vec<(StepKey, String)> = plan
        .steps
        .values()
        .filter(|s| s.template && s.mapping_root.as_deref() == Some(producer))
        .map(|s| (s.key.clone(), s.node.clone()))
        .collect();

    for key in &clones {
        plan.steps.remove(key);
    }
    let mut nodes = BTreeSet::new();
    for (key, node) in &templates {
        plan.expanded.remove(key);
        plan.node_steps.insert(node.clone(), vec![key.clone()]);
        if let Some(template) = plan.steps.get_mut(key) {
            template.source = StepSource::Fresh;
        }
        nodes.insert(node.clone());
    }

    // Any fan-in resolved against the collapsed group goes back to pending,
    // zero-clone joins included.
    for step in plan.steps.values_mut() {
        for input in &mut step.inputs {
            if let StepInputSource::FanIn { node, output, .. } = &input.source {
                if nodes.contains(node) {
                    input.source = StepInputSource::PendingFanIn {
                        node: node.clone(),
                        output: output.clone(),
                    };
                }
            }
        }
    }
}

/// Check that every artifact a reused step would replay still exists.
pub async fn verify_reused(plan: &ExecutionPlan, artifacts: &dyn ArtifactStore) -> Result<()> {
    for step in plan.live_steps() {
        let StepSource::Reused {
            run_id,
            step: source_step,
            outputs,
        } = &step.source
        else {
            continue;
        };
        for output in outputs {
            let handle = cascade_types::ArtifactHandle {
                run_id: *run_id,
                step: source_step.clone(),
                output: output.clone(),
            };
            if !artifacts.exists(&handle).await {
                return Err(CascadeError::StaleParentArtifact {
                    step: step.key.clone(),
                    output: output.clone(),
                    parent_run_id: *run_id,
                });
            }
        }
    }
    Ok(())
}
