//! Coordinating run loop: polls the scheduler, dispatches ready batches to
//! compute, persists artifacts, and drives dynamic expansion.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use cascade_graph::GraphDef;
use cascade_types::{ArtifactHandle, CascadeError, Result, RunConfig, StepStatus};

use crate::collaborators::{ArtifactStore, Compute, ComputeResult, Emitted, RunStore};
use crate::compiler::{compile, expand_dynamic};
use crate::events::{EngineEvent, EventEmitter};
use crate::plan::{ExecutionPlan, ExecutionStep, StepInputSource, StepSource};
use crate::reexecution::{plan_reexecution, verify_reused, ReexecutionMode};
use crate::run::RunRecord;
use crate::scheduler::{apply_outcome, poll, RunState, StepOutcome};

/// Requests cancellation of the run owned by the executor that issued it.
/// Honored at the next poll: running steps finish, everything else is swept.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Drives one run at a time against pluggable collaborators.
pub struct RunExecutor {
    compute: Arc<dyn Compute>,
    artifacts: Arc<dyn ArtifactStore>,
    runs: Arc<dyn RunStore>,
    emitter: EventEmitter,
    cancel: Arc<AtomicBool>,
}

impl RunExecutor {
    pub fn new(
        compute: Arc<dyn Compute>,
        artifacts: Arc<dyn ArtifactStore>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            compute,
            artifacts,
            runs,
            emitter: EventEmitter::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.emitter.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancel),
        }
    }

    /// Compile `graph` under `config` and run it to quiescence.
    pub async fn execute(&self, graph: &GraphDef, config: RunConfig) -> Result<RunRecord> {
        let plan = compile(graph, &config)?;
        self.execute_plan(plan, None, config).await
    }

    /// Derive a child plan from a stored run and execute it. Reused artifacts
    /// are verified before any compute starts.
    pub async fn execute_reexecution(
        &self,
        parent_run_id: Uuid,
        mode: ReexecutionMode,
        selection: Option<&str>,
        config: RunConfig,
    ) -> Result<RunRecord> {
        let parent = self.runs.get_run(parent_run_id).await?;
        let plan = plan_reexecution(&parent, mode, selection)?;
        verify_reused(&plan, self.artifacts.as_ref()).await?;
        self.execute_plan(plan, Some(parent_run_id), config).await
    }

    async fn execute_plan(
        &self,
        mut plan: ExecutionPlan,
        parent_run_id: Option<Uuid>,
        config: RunConfig,
    ) -> Result<RunRecord> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut state = RunState::new(&plan, config.missing_output_policy);
        let mut cursor = 0usize;

        self.runs.create_run(run_id, parent_run_id).await?;
        self.emitter.emit(EngineEvent::RunStarted {
            run_id,
            parent_run_id,
            step_count: plan.live_steps().count(),
        });
        info!(%run_id, steps = plan.live_steps().count(), "Run started");

        loop {
            if self.cancel.load(Ordering::SeqCst) && !state.is_cancelled() {
                state.cancel();
            }

            let batch = poll(&plan, &mut state);
            self.flush_events(run_id, &state, &mut cursor).await?;

            if batch.is_empty() {
                if state.all_terminal() {
                    break;
                }
                return Err(CascadeError::Other(format!(
                    "run {run_id} stalled with non-terminal steps and an empty ready batch"
                )));
            }

            let mut tasks: JoinSet<(String, ComputeResult)> = JoinSet::new();
            for key in batch {
                let step = plan
                    .step(&key)
                    .ok_or_else(|| CascadeError::UnknownStep { step: key.clone() })?
                    .clone();
                let inputs = self.gather_inputs(&plan, &state, run_id, &step).await?;
                apply_outcome(&plan, &mut state, &key, StepOutcome::Started)?;

                let compute = Arc::clone(&self.compute);
                tasks.spawn(async move {
                    let result = compute.execute(&step, inputs).await;
                    (step.key, result)
                });
            }
            self.flush_events(run_id, &state, &mut cursor).await?;

            while let Some(joined) = tasks.join_next().await {
                let (key, result) = joined
                    .map_err(|e| CascadeError::Other(format!("compute task panicked: {e}")))?;
                self.settle(&mut plan, &mut state, run_id, &key, result)
                    .await?;
                self.flush_events(run_id, &state, &mut cursor).await?;
            }
        }

        let record = RunRecord {
            run_id,
            parent_run_id,
            plan,
            statuses: state.snapshot(),
            emitted: state.emitted_snapshot(),
            events: state.events().to_vec(),
            started_at,
            finished_at: Utc::now(),
        };
        self.runs.finalize_run(record.clone()).await?;

        if state.is_cancelled() {
            warn!(%run_id, "Run cancelled");
            self.emitter.emit(EngineEvent::RunCancelled { run_id });
        } else {
            let succeeded = state.count_with(StepStatus::Succeeded);
            let failed = state.count_with(StepStatus::Failed);
            let skipped = state.count_skipped();
            info!(%run_id, succeeded, failed, skipped, "Run completed");
            self.emitter.emit(EngineEvent::RunCompleted {
                run_id,
                succeeded,
                failed,
                skipped,
            });
        }
        Ok(record)
    }

    /// Persist a finished step's outputs, record its outcome, and expand any
    /// dynamic output it produced.
    async fn settle(
        &self,
        plan: &mut ExecutionPlan,
        state: &mut RunState,
        run_id: Uuid,
        key: &str,
        result: ComputeResult,
    ) -> Result<()> {
        if !result.success {
            return apply_outcome(plan, state, key, StepOutcome::Failed);
        }

        // A failed artifact write fails the step, not the run; unrelated
        // branches keep executing.
        let mut dynamic_keys: Vec<(String, Vec<String>)> = Vec::new();
        for (name, emitted) in &result.outputs {
            match emitted {
                Emitted::Single(value) => {
                    if let Err(error) = self.artifacts.store(run_id, key, name, value.clone()).await
                    {
                        warn!(step = key, %error, "Artifact write failed");
                        return apply_outcome(plan, state, key, StepOutcome::Failed);
                    }
                }
                Emitted::Keyed(map) => {
                    for (mapping_key, value) in map {
                        let instance = format!("{name}[{mapping_key}]");
                        if let Err(error) = self
                            .artifacts
                            .store(run_id, key, &instance, value.clone())
                            .await
                        {
                            warn!(step = key, %error, "Artifact write failed");
                            return apply_outcome(plan, state, key, StepOutcome::Failed);
                        }
                    }
                    dynamic_keys.push((name.clone(), map.keys().cloned().collect()));
                }
            }
        }

        let emitted_names = result.emitted_names();
        apply_outcome(
            plan,
            state,
            key,
            StepOutcome::Succeeded {
                outputs: emitted_names,
            },
        )?;

        // The missing-output policy can turn the outcome into a failure, in
        // which case the mapping group is poisoned rather than expanded.
        if state.status(key) != Some(StepStatus::Succeeded) {
            return Ok(());
        }
        let declared_dynamic: Vec<String> = plan
            .step(key)
            .map(|s| {
                s.outputs
                    .iter()
                    .filter(|o| o.is_dynamic)
                    .map(|o| o.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        for output in declared_dynamic {
            let keys = dynamic_keys
                .iter()
                .find(|(name, _)| *name == output)
                .map(|(_, keys)| keys.clone())
                .unwrap_or_default();
            let new_steps = expand_dynamic(plan, key, &output, &keys)?;
            state.sync_with_plan(plan);
            self.emitter.emit(EngineEvent::DynamicExpanded {
                run_id,
                producer: key.to_string(),
                output,
                new_steps,
            });
        }
        Ok(())
    }

    /// Materialize one ready step's input values from upstream artifacts.
    async fn gather_inputs(
        &self,
        plan: &ExecutionPlan,
        state: &RunState,
        run_id: Uuid,
        step: &ExecutionStep,
    ) -> Result<BTreeMap<String, Value>> {
        let mut values = BTreeMap::new();
        for input in &step.inputs {
            match &input.source {
                StepInputSource::Literal(value) => {
                    values.insert(input.name.clone(), value.clone());
                }
                StepInputSource::FromOutput { step: p, output } => {
                    let value = self.load_from(plan, run_id, p, output).await?;
                    values.insert(input.name.clone(), value);
                }
                StepInputSource::FanIn { steps, output, .. } => {
                    // Join over the succeeded siblings; skipped members
                    // contribute nothing. A collect directly over a dynamic
                    // output joins its keyed instances.
                    let instance_prefix = format!("{output}[");
                    let mut joined = Vec::new();
                    for p in steps {
                        if state.status(p) != Some(StepStatus::Succeeded) {
                            continue;
                        }
                        let Some(emitted) = state.emitted(p) else { continue };
                        for name in emitted {
                            if name == output
                                || (name.starts_with(&instance_prefix) && name.ends_with(']'))
                            {
                                joined.push(self.load_from(plan, run_id, p, name).await?);
                            }
                        }
                    }
                    values.insert(input.name.clone(), Value::Array(joined));
                }
                // Ordering constraints carry no data; readiness already
                // accounted for them.
                StepInputSource::Ordering { .. } => {}
                StepInputSource::PendingFanIn { .. }
                | StepInputSource::FromMappedInstance { .. } => {
                    return Err(CascadeError::Other(format!(
                        "step '{}' became ready with an unexpanded input '{}'",
                        step.key, input.name
                    )));
                }
            }
        }
        Ok(values)
    }

    /// Load one output value, following a reused step's provenance back to
    /// the run that actually produced the artifact.
    async fn load_from(
        &self,
        plan: &ExecutionPlan,
        run_id: Uuid,
        producer: &str,
        output: &str,
    ) -> Result<Value> {
        let handle = match plan.step(producer).map(|s| &s.source) {
            Some(StepSource::Reused {
                run_id: source_run,
                step: source_step,
                ..
            }) => ArtifactHandle {
                run_id: *source_run,
                step: source_step.clone(),
                output: output.to_string(),
            },
            _ => ArtifactHandle {
                run_id,
                step: producer.to_string(),
                output: output.to_string(),
            },
        };
        self.artifacts.load(&handle).await
    }

    /// Forward transitions recorded since the last flush to the run store
    /// and to broadcast subscribers.
    async fn flush_events(
        &self,
        run_id: Uuid,
        state: &RunState,
        cursor: &mut usize,
    ) -> Result<()> {
        for event in state.events_since(*cursor) {
            self.runs.append_event(run_id, event.clone()).await?;
            self.emitter.emit(EngineEvent::StepTransition {
                run_id,
                event: event.clone(),
            });
        }
        *cursor = state.events().len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FnCompute, MemoryArtifactStore, MemoryRunStore};
    use cascade_graph::{DependencySource, GraphBuilder, InputDef, NodeDef, OutputDef};
    use cascade_types::SemanticType;
    use serde_json::json;

    fn executor(compute: FnCompute) -> RunExecutor {
        RunExecutor::new(
            Arc::new(compute),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(MemoryRunStore::new()),
        )
    }

    fn linear_graph() -> GraphDef {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::source("a", "out"));
        for n in ["b", "c"] {
            builder.add_node(NodeDef::new(
                n,
                vec![InputDef::new("in", SemanticType::Int)],
                vec![OutputDef::new("out", SemanticType::Int)],
            ));
        }
        builder
            .add_dependency(
                "b",
                "in",
                DependencySource::Output {
                    node: "a".into(),
                    output: "out".into(),
                },
            )
            .unwrap();
        builder
            .add_dependency(
                "c",
                "in",
                DependencySource::Output {
                    node: "b".into(),
                    output: "out".into(),
                },
            )
            .unwrap();
        builder.build().unwrap()
    }

    fn incrementing_compute() -> FnCompute {
        FnCompute::new()
            .register("a", |_, _| {
                ComputeResult::values([("out".to_string(), json!(1))])
            })
            .register("b", |_, inputs| {
                let n = inputs["in"].as_i64().unwrap();
                ComputeResult::values([("out".to_string(), json!(n + 1))])
            })
            .register("c", |_, inputs| {
                let n = inputs["in"].as_i64().unwrap();
                ComputeResult::values([("out".to_string(), json!(n + 1))])
            })
    }

    #[tokio::test]
    async fn linear_pipeline_runs_to_completion() {
        let exec = executor(incrementing_compute());
        let record = exec.execute(&linear_graph(), RunConfig::new()).await.unwrap();

        assert!(record.succeeded());
        assert_eq!(record.status("c"), Some(StepStatus::Succeeded));

        let value = exec
            .artifacts
            .load(&ArtifactHandle {
                run_id: record.run_id,
                step: "c".into(),
                output: "out".into(),
            })
            .await
            .unwrap();
        assert_eq!(value, json!(3));
    }

    #[tokio::test]
    async fn finished_run_is_persisted() {
        let exec = executor(incrementing_compute());
        let record = exec.execute(&linear_graph(), RunConfig::new()).await.unwrap();
        let stored = exec.runs.get_run(record.run_id).await.unwrap();
        assert_eq!(stored.statuses, record.statuses);
        assert!(stored.events.iter().any(|e| e.step == "c"));
    }

    #[tokio::test]
    async fn cancellation_mid_run_sweeps_the_rest() {
        let exec = executor(FnCompute::new());
        let handle = exec.cancel_handle();
        let compute = FnCompute::new()
            .register("a", move |_, _| {
                handle.cancel();
                ComputeResult::values([("out".to_string(), json!(1))])
            })
            .register("b", |_, _| ComputeResult::values([("out".to_string(), json!(2))]))
            .register("c", |_, _| ComputeResult::values([("out".to_string(), json!(3))]));
        let exec = RunExecutor {
            compute: Arc::new(compute),
            ..exec
        };

        let record = exec.execute(&linear_graph(), RunConfig::new()).await.unwrap();
        assert_eq!(record.status("a"), Some(StepStatus::Succeeded));
        assert!(matches!(
            record.status("b"),
            Some(StepStatus::Skipped(_))
        ));
        assert!(matches!(
            record.status("c"),
            Some(StepStatus::Skipped(_))
        ));
        // Nothing failed, but a swept run did not succeed either.
        assert!(!record.succeeded());
    }

    #[tokio::test]
    async fn compute_failure_is_recorded_not_raised() {
        let compute = incrementing_compute().register("b", |_, _| ComputeResult::failure());
        let exec = executor(compute);
        let record = exec.execute(&linear_graph(), RunConfig::new()).await.unwrap();

        assert!(!record.succeeded());
        assert_eq!(record.status("b"), Some(StepStatus::Failed));
        assert!(matches!(record.status("c"), Some(StepStatus::Skipped(_))));
    }
}
