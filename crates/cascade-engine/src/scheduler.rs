//! Dependency resolver and step state machine.
//!
//! [`poll`] is a pure state-transition function over the step outcome set: it
//! marks eligible steps ready, applies skip propagation, and returns the
//! current ready batch. It performs no compute and never retries. All outcome
//! mutation funnels through [`RunState`], which serializes transitions under
//! a single per-run logical clock.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::trace;

use cascade_types::{
    CascadeError, MissingOutputPolicy, Result, SkipReason, StepKey, StepStatus,
};

use crate::events::RunEvent;
use crate::plan::{ExecutionPlan, ExecutionStep, StepInputSource, StepSource};

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Mutable record of one run: status and emitted outputs per step, the event
/// log, and the cancellation flag.
///
/// This is the only mutable shared state in the engine. It is owned by the
/// coordinating task; other components read it through [`RunState::snapshot`].
#[derive(Debug, Clone)]
pub struct RunState {
    statuses: BTreeMap<StepKey, StepStatus>,
    emitted: BTreeMap<StepKey, BTreeSet<String>>,
    policy: MissingOutputPolicy,
    seq: u64,
    events: Vec<RunEvent>,
    cancelled: bool,
}

impl RunState {
    pub fn new(plan: &ExecutionPlan, policy: MissingOutputPolicy) -> Self {
        let statuses = plan
            .live_steps()
            .map(|s| (s.key.clone(), StepStatus::Pending))
            .collect();
        Self {
            statuses,
            emitted: BTreeMap::new(),
            policy,
            seq: 0,
            events: Vec::new(),
            cancelled: false,
        }
    }

    /// Reconcile with a plan that was expanded in place: register new clones
    /// as pending, drop replaced templates.
    pub fn sync_with_plan(&mut self, plan: &ExecutionPlan) {
        self.statuses.retain(|key, _| plan.is_live(key));
        for step in plan.live_steps() {
            self.statuses
                .entry(step.key.clone())
                .or_insert(StepStatus::Pending);
        }
    }

    pub fn status(&self, key: &str) -> Option<StepStatus> {
        self.statuses.get(key).copied()
    }

    pub fn emitted(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.emitted.get(key)
    }

    pub fn policy(&self) -> MissingOutputPolicy {
        self.policy
    }

    /// Read-only view of the outcome set.
    pub fn snapshot(&self) -> BTreeMap<StepKey, StepStatus> {
        self.statuses.clone()
    }

    pub fn emitted_snapshot(&self) -> BTreeMap<StepKey, BTreeSet<String>> {
        self.emitted.clone()
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    /// Events appended at or after `cursor`; the caller advances its own
    /// cursor to `self.events().len()`.
    pub fn events_since(&self, cursor: usize) -> &[RunEvent] {
        &self.events[cursor.min(self.events.len())..]
    }

    /// Raise the run-level cancellation flag; honored on the next poll.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn all_terminal(&self) -> bool {
        self.statuses.values().all(StepStatus::is_terminal)
    }

    pub fn count_with(&self, status: StepStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    pub fn count_skipped(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| matches!(s, StepStatus::Skipped(_)))
            .count()
    }

    fn record(&mut self, key: &str, status: StepStatus) {
        self.seq += 1;
        self.statuses.insert(key.to_string(), status);
        self.events.push(RunEvent {
            seq: self.seq,
            step: key.to_string(),
            status,
            at: Utc::now(),
        });
        trace!(step = key, %status, seq = self.seq, "Step transition");
    }

    /// Monotonicity-checked transition; the scheduler's only write path.
    fn transition(&mut self, key: &str, next: StepStatus) -> Result<()> {
        let current = self
            .statuses
            .get(key)
            .copied()
            .ok_or_else(|| CascadeError::UnknownStep {
                step: key.to_string(),
            })?;
        if !current.can_transition_to(next) {
            return Err(CascadeError::IllegalTransition {
                step: key.to_string(),
                from: current,
                to: next,
            });
        }
        self.record(key, next);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Outcome reported back for one step by the dispatching caller.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The step was handed to the compute collaborator.
    Started,
    /// Compute finished; `outputs` are the emitted output names, keyed
    /// dynamic instances as `name[key]`.
    Succeeded { outputs: BTreeSet<String> },
    /// Compute raised or the artifact write failed.
    Failed,
}

/// Record a step outcome under the run's logical clock.
///
/// Rejects outcomes for unknown steps and any non-monotonic transition.
/// Omission of a required static output is resolved against the run's
/// [`MissingOutputPolicy`].
pub fn apply_outcome(
    plan: &ExecutionPlan,
    state: &mut RunState,
    key: &str,
    outcome: StepOutcome,
) -> Result<()> {
    let step = plan.step(key).ok_or_else(|| CascadeError::UnknownStep {
        step: key.to_string(),
    })?;
    match outcome {
        StepOutcome::Started => state.transition(key, StepStatus::Running),
        StepOutcome::Failed => state.transition(key, StepStatus::Failed),
        StepOutcome::Succeeded { outputs } => {
            let omitted_required = step
                .outputs
                .iter()
                .any(|o| o.is_required && !o.is_dynamic && !outputs.contains(&o.name));
            if omitted_required && state.policy() == MissingOutputPolicy::FailStep {
                return state.transition(key, StepStatus::Failed);
            }
            state.transition(key, StepStatus::Succeeded)?;
            state.emitted.insert(key.to_string(), outputs);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

enum Verdict {
    Ready,
    Skip(SkipReason),
    /// Reused step: replay the source run's emitted outputs.
    Replay(BTreeSet<String>),
    Wait,
}

/// Compute the current ready batch.
///
/// Runs skip propagation to a fixed point first, so two steps completing
/// concurrently still yield one deterministic propagation order (steps are
/// visited in key order under the single logical clock). Calling `poll`
/// twice without an intervening [`apply_outcome`] returns the same batch.
pub fn poll(plan: &ExecutionPlan, state: &mut RunState) -> Vec<StepKey> {
    if state.is_cancelled() {
        let pending: Vec<StepKey> = state
            .statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(k, _)| k.clone())
            .collect();
        for key in pending {
            state.record(&key, StepStatus::Skipped(SkipReason::Cancelled));
        }
        return Vec::new();
    }

    loop {
        let pending: Vec<StepKey> = state
            .statuses
            .iter()
            .filter(|(_, s)| **s == StepStatus::Pending)
            .map(|(k, _)| k.clone())
            .collect();

        let mut changed = false;
        for key in pending {
            let Some(step) = plan.step(&key) else { continue };
            match evaluate(plan, state, step) {
                Verdict::Ready => {
                    state.record(&key, StepStatus::Ready);
                    changed = true;
                }
                Verdict::Skip(reason) => {
                    state.record(&key, StepStatus::Skipped(reason));
                    changed = true;
                }
                Verdict::Replay(outputs) => {
                    state.record(&key, StepStatus::Succeeded);
                    state.emitted.insert(key.clone(), outputs);
                    changed = true;
                }
                Verdict::Wait => {}
            }
        }
        if !changed {
            break;
        }
    }

    state
        .statuses
        .iter()
        .filter(|(_, s)| **s == StepStatus::Ready)
        .map(|(k, _)| k.clone())
        .collect()
}

/// Readiness of one pending step against the current outcome set.
fn evaluate(plan: &ExecutionPlan, state: &RunState, step: &ExecutionStep) -> Verdict {
    // Reused steps replay the source run's outputs; readiness of their own
    // upstreams is irrelevant, provenance was verified at planning.
    if let StepSource::Reused { outputs, .. } = &step.source {
        return Verdict::Replay(outputs.clone());
    }

    let mut satisfied = true;
    for input in &step.inputs {
        match &input.source {
            StepInputSource::Literal(_) => {}
            StepInputSource::FromOutput { step: p, output } => {
                match state.status(p) {
                    Some(StepStatus::Succeeded) => {
                        let present = state
                            .emitted(p)
                            .map(|set| set.contains(output))
                            .unwrap_or(false);
                        if !present {
                            return Verdict::Skip(SkipReason::OutputNotEmitted);
                        }
                    }
                    Some(StepStatus::Failed) => {
                        return Verdict::Skip(SkipReason::UpstreamFailure)
                    }
                    Some(StepStatus::Skipped(reason)) => return Verdict::Skip(reason),
                    _ => satisfied = false,
                }
            }
            StepInputSource::FanIn { steps, .. } => {
                for p in steps {
                    match state.status(p) {
                        Some(StepStatus::Failed) => {
                            return Verdict::Skip(SkipReason::UpstreamFailure)
                        }
                        Some(s) if s.is_terminal() => {}
                        _ => satisfied = false,
                    }
                }
            }
            StepInputSource::PendingFanIn { node, .. }
            | StepInputSource::FromMappedInstance { node, .. } => {
                // Group not yet expanded: wait on (or inherit skips from)
                // whatever currently stands for the invocation.
                for p in plan.steps_for_node(node) {
                    match state.status(p) {
                        Some(StepStatus::Failed) => {
                            return Verdict::Skip(SkipReason::UpstreamFailure)
                        }
                        Some(StepStatus::Skipped(reason)) => return Verdict::Skip(reason),
                        Some(StepStatus::Succeeded) => {}
                        _ => satisfied = false,
                    }
                }
            }
            StepInputSource::Ordering { nodes } => {
                // Ordering edges wait for terminality but do not propagate
                // skip; a failed upstream still poisons the dependent.
                for node in nodes {
                    for p in plan.steps_for_node(node) {
                        match state.status(p) {
                            Some(StepStatus::Succeeded) | Some(StepStatus::Skipped(_)) => {}
                            Some(StepStatus::Failed) => {
                                return Verdict::Skip(SkipReason::UpstreamFailure)
                            }
                            _ => satisfied = false,
                        }
                    }
                }
            }
        }
    }

    if !satisfied || step.template {
        // Templates hold their place until the dynamic producer's keys
        // arrive; expansion replaces them with schedulable clones.
        Verdict::Wait
    } else {
        Verdict::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, expand_dynamic};
    use cascade_graph::{
        DependencySource, GraphBuilder, GraphDef, InputDef, NodeDef, OutputDef,
    };
    use cascade_types::{RunConfig, SemanticType};
    use uuid::Uuid;

    fn passthrough(name: &str) -> NodeDef {
        NodeDef::new(
            name,
            vec![InputDef::new("in", SemanticType::Any)],
            vec![OutputDef::new("out", SemanticType::Any)],
        )
    }

    fn out_of(node: &str) -> DependencySource {
        DependencySource::Output {
            node: node.into(),
            output: "out".into(),
        }
    }

    fn linear_graph() -> GraphDef {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::source("a", "out"));
        builder.add_node(passthrough("b"));
        builder.add_node(passthrough("c"));
        builder.add_dependency("b", "in", out_of("a")).unwrap();
        builder.add_dependency("c", "in", out_of("b")).unwrap();
        builder.build().unwrap()
    }

    fn fresh(plan: &ExecutionPlan) -> RunState {
        RunState::new(plan, MissingOutputPolicy::FailStep)
    }

    fn succeed(plan: &ExecutionPlan, state: &mut RunState, key: &str, outputs: &[&str]) {
        apply_outcome(plan, state, key, StepOutcome::Started).unwrap();
        apply_outcome(
            plan,
            state,
            key,
            StepOutcome::Succeeded {
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
            },
        )
        .unwrap();
    }

    fn fail(plan: &ExecutionPlan, state: &mut RunState, key: &str) {
        apply_outcome(plan, state, key, StepOutcome::Started).unwrap();
        apply_outcome(plan, state, key, StepOutcome::Failed).unwrap();
    }

    #[test]
    fn roots_become_ready_first() {
        let plan = compile(&linear_graph(), &RunConfig::new()).unwrap();
        let mut state = fresh(&plan);
        assert_eq!(poll(&plan, &mut state), vec!["a".to_string()]);
    }

    #[test]
    fn poll_is_idempotent() {
        let plan = compile(&linear_graph(), &RunConfig::new()).unwrap();
        let mut state = fresh(&plan);
        let first = poll(&plan, &mut state);
        let second = poll(&plan, &mut state);
        assert_eq!(first, second);
        assert_eq!(state.events().len(), 1); // only one Ready transition recorded
    }

    #[test]
    fn completion_unlocks_downstream() {
        let plan = compile(&linear_graph(), &RunConfig::new()).unwrap();
        let mut state = fresh(&plan);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &["out"]);
        assert_eq!(poll(&plan, &mut state), vec!["b".to_string()]);
    }

    #[test]
    fn optional_output_not_emitted_skips_downstream_transitively() {
        // a emits nothing it was allowed to withhold; b and c skip, never fail.
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::new(
            "a",
            vec![],
            vec![OutputDef::new("out", SemanticType::Any).optional()],
        ));
        builder.add_node(passthrough("b"));
        builder.add_node(passthrough("c"));
        builder.add_dependency("b", "in", out_of("a")).unwrap();
        builder.add_dependency("c", "in", out_of("b")).unwrap();
        let plan = compile(&builder.build().unwrap(), &RunConfig::new()).unwrap();

        let mut state = fresh(&plan);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &[]);
        let batch = poll(&plan, &mut state);

        assert!(batch.is_empty());
        assert_eq!(
            state.status("b"),
            Some(StepStatus::Skipped(SkipReason::OutputNotEmitted))
        );
        assert_eq!(
            state.status("c"),
            Some(StepStatus::Skipped(SkipReason::OutputNotEmitted))
        );
    }

    #[test]
    fn failure_skips_dependents_but_isolates_siblings() {
        // a -> b, a -> c; b fails, c still succeeds; d (downstream of b) skips.
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::source("a", "out"));
        for n in ["b", "c", "d"] {
            builder.add_node(passthrough(n));
        }
        builder.add_dependency("b", "in", out_of("a")).unwrap();
        builder.add_dependency("c", "in", out_of("a")).unwrap();
        builder.add_dependency("d", "in", out_of("b")).unwrap();
        let plan = compile(&builder.build().unwrap(), &RunConfig::new()).unwrap();

        let mut state = fresh(&plan);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &["out"]);
        let batch = poll(&plan, &mut state);
        assert_eq!(batch, vec!["b".to_string(), "c".to_string()]);

        fail(&plan, &mut state, "b");
        let batch = poll(&plan, &mut state);
        assert_eq!(batch, vec!["c".to_string()]);
        assert_eq!(
            state.status("d"),
            Some(StepStatus::Skipped(SkipReason::UpstreamFailure))
        );

        succeed(&plan, &mut state, "c", &["out"]);
        assert_eq!(state.status("c"), Some(StepStatus::Succeeded));
    }

    #[test]
    fn ordering_dependency_tolerates_skip_but_not_failure() {
        // b sits between a and an ordering gate; a skipped b still releases
        // the gate, a failed b does not.
        fn build() -> ExecutionPlan {
            let mut builder = GraphBuilder::new();
            builder.add_node(NodeDef::new(
                "a",
                vec![],
                vec![OutputDef::new("out", SemanticType::Any).optional()],
            ));
            builder.add_node(passthrough("b"));
            builder.add_node(NodeDef::new(
                "gate",
                vec![InputDef::nothing("after")],
                vec![OutputDef::new("out", SemanticType::Any)],
            ));
            builder.add_dependency("b", "in", out_of("a")).unwrap();
            builder
                .add_dependency("gate", "after", DependencySource::Ordering(vec!["b".into()]))
                .unwrap();
            compile(&builder.build().unwrap(), &RunConfig::new()).unwrap()
        }

        // b skips because a withheld its output; gate still runs.
        let plan = build();
        let mut state = fresh(&plan);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &[]);
        let batch = poll(&plan, &mut state);
        assert_eq!(
            state.status("b"),
            Some(StepStatus::Skipped(SkipReason::OutputNotEmitted))
        );
        assert_eq!(batch, vec!["gate".to_string()]);

        // b fails; gate is poisoned.
        let plan = build();
        let mut state = fresh(&plan);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &["out"]);
        poll(&plan, &mut state);
        fail(&plan, &mut state, "b");
        assert!(poll(&plan, &mut state).is_empty());
        assert_eq!(
            state.status("gate"),
            Some(StepStatus::Skipped(SkipReason::UpstreamFailure))
        );
    }

    fn fan_out_plan() -> (ExecutionPlan, RunState) {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::new(
            "fan",
            vec![],
            vec![OutputDef::new("items", SemanticType::Json).dynamic()],
        ));
        builder.add_node(passthrough("each"));
        builder.add_node(passthrough("total"));
        builder
            .add_dependency(
                "each",
                "in",
                DependencySource::MappedOutput {
                    node: "fan".into(),
                    output: "items".into(),
                },
            )
            .unwrap();
        builder
            .add_dependency(
                "total",
                "in",
                DependencySource::Collected {
                    node: "each".into(),
                    output: "out".into(),
                },
            )
            .unwrap();
        let plan = compile(&builder.build().unwrap(), &RunConfig::new()).unwrap();
        let state = fresh(&plan);
        (plan, state)
    }

    #[test]
    fn fan_out_round_trip() {
        let (mut plan, mut state) = fan_out_plan();
        assert_eq!(poll(&plan, &mut state), vec!["fan".to_string()]);

        succeed(
            &plan,
            &mut state,
            "fan",
            &["items[x]", "items[y]", "items[z]"],
        );
        let keys: Vec<String> = ["x", "y", "z"].map(String::from).to_vec();
        let new = expand_dynamic(&mut plan, "fan", "items", &keys).unwrap();
        assert_eq!(new.len(), 3);
        state.sync_with_plan(&plan);

        // Exactly the three clones are ready; the collect join waits.
        let batch = poll(&plan, &mut state);
        assert_eq!(
            batch,
            vec![
                "each[x]".to_string(),
                "each[y]".to_string(),
                "each[z]".to_string()
            ]
        );

        succeed(&plan, &mut state, "each[x]", &["out"]);
        succeed(&plan, &mut state, "each[y]", &["out"]);
        assert!(!poll(&plan, &mut state).contains(&"total".to_string()));

        succeed(&plan, &mut state, "each[z]", &["out"]);
        assert_eq!(poll(&plan, &mut state), vec!["total".to_string()]);
    }

    #[test]
    fn fan_in_skips_when_any_sibling_fails() {
        let (mut plan, mut state) = fan_out_plan();
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "fan", &["items[x]", "items[y]"]);
        let keys: Vec<String> = ["x", "y"].map(String::from).to_vec();
        expand_dynamic(&mut plan, "fan", "items", &keys).unwrap();
        state.sync_with_plan(&plan);
        poll(&plan, &mut state);

        succeed(&plan, &mut state, "each[x]", &["out"]);
        fail(&plan, &mut state, "each[y]");
        assert!(poll(&plan, &mut state).is_empty());
        assert_eq!(
            state.status("total"),
            Some(StepStatus::Skipped(SkipReason::UpstreamFailure))
        );
    }

    #[test]
    fn failed_producer_skips_whole_mapping_group() {
        let (plan, mut state) = fan_out_plan();
        poll(&plan, &mut state);
        fail(&plan, &mut state, "fan");
        assert!(poll(&plan, &mut state).is_empty());
        assert_eq!(
            state.status("each"),
            Some(StepStatus::Skipped(SkipReason::UpstreamFailure))
        );
        assert_eq!(
            state.status("total"),
            Some(StepStatus::Skipped(SkipReason::UpstreamFailure))
        );
    }

    #[test]
    fn reused_steps_replay_without_compute() {
        let mut plan = compile(&linear_graph(), &RunConfig::new()).unwrap();
        let parent_run = Uuid::new_v4();
        plan.steps.get_mut("a").unwrap().source = StepSource::Reused {
            run_id: parent_run,
            step: "a".into(),
            outputs: BTreeSet::from(["out".to_string()]),
        };

        let mut state = fresh(&plan);
        let batch = poll(&plan, &mut state);
        // a replays straight to succeeded; b is immediately ready.
        assert_eq!(state.status("a"), Some(StepStatus::Succeeded));
        assert_eq!(batch, vec!["b".to_string()]);
    }

    #[test]
    fn cancellation_sweeps_non_terminal_steps() {
        let plan = compile(&linear_graph(), &RunConfig::new()).unwrap();
        let mut state = fresh(&plan);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &["out"]);
        state.cancel();

        assert!(poll(&plan, &mut state).is_empty());
        assert_eq!(state.status("a"), Some(StepStatus::Succeeded));
        assert_eq!(
            state.status("b"),
            Some(StepStatus::Skipped(SkipReason::Cancelled))
        );
        assert_eq!(
            state.status("c"),
            Some(StepStatus::Skipped(SkipReason::Cancelled))
        );
        assert!(state.all_terminal());
    }

    #[test]
    fn outcomes_never_regress() {
        let plan = compile(&linear_graph(), &RunConfig::new()).unwrap();
        let mut state = fresh(&plan);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &["out"]);

        let err = apply_outcome(&plan, &mut state, "a", StepOutcome::Failed).unwrap_err();
        assert!(matches!(err, CascadeError::IllegalTransition { .. }));
        assert_eq!(state.status("a"), Some(StepStatus::Succeeded));
    }

    #[test]
    fn unknown_step_outcome_rejected() {
        let plan = compile(&linear_graph(), &RunConfig::new()).unwrap();
        let mut state = fresh(&plan);
        let err = apply_outcome(&plan, &mut state, "ghost", StepOutcome::Failed).unwrap_err();
        assert!(matches!(err, CascadeError::UnknownStep { .. }));
    }

    #[test]
    fn event_sequence_is_strictly_increasing() {
        let plan = compile(&linear_graph(), &RunConfig::new()).unwrap();
        let mut state = fresh(&plan);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &["out"]);
        poll(&plan, &mut state);

        let seqs: Vec<u64> = state.events().iter().map(|e| e.seq).collect();
        for pair in seqs.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    // --- MissingOutputPolicy branches ---

    fn required_output_graph() -> GraphDef {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::source("a", "out"));
        builder.add_node(passthrough("b"));
        builder.add_dependency("b", "in", out_of("a")).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn missing_required_output_fails_step_under_fail_policy() {
        let plan = compile(&required_output_graph(), &RunConfig::new()).unwrap();
        let mut state = RunState::new(&plan, MissingOutputPolicy::FailStep);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &[]);

        assert_eq!(state.status("a"), Some(StepStatus::Failed));
        poll(&plan, &mut state);
        assert_eq!(
            state.status("b"),
            Some(StepStatus::Skipped(SkipReason::UpstreamFailure))
        );
    }

    #[test]
    fn missing_required_output_skips_downstream_under_lenient_policy() {
        let plan = compile(&required_output_graph(), &RunConfig::new()).unwrap();
        let mut state = RunState::new(&plan, MissingOutputPolicy::SkipDownstream);
        poll(&plan, &mut state);
        succeed(&plan, &mut state, "a", &[]);

        assert_eq!(state.status("a"), Some(StepStatus::Succeeded));
        poll(&plan, &mut state);
        assert_eq!(
            state.status("b"),
            Some(StepStatus::Skipped(SkipReason::OutputNotEmitted))
        );
    }
}
