//! Pluggable collaborators at the engine's seams: compute, artifact storage,
//! and run storage.
//!
//! The engine only ever talks to these traits; the in-memory implementations
//! here back tests and single-process embedding.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use cascade_types::{ArtifactHandle, CascadeError, Result, StepKey};

use crate::events::RunEvent;
use crate::plan::ExecutionStep;
use crate::run::RunRecord;

// ---------------------------------------------------------------------------
// Compute
// ---------------------------------------------------------------------------

/// Value(s) a step produced for one declared output.
#[derive(Debug, Clone)]
pub enum Emitted {
    Single(Value),
    /// Dynamic output: one value per mapping key.
    Keyed(BTreeMap<String, Value>),
}

/// What a compute invocation reported back. An absent output name means the
/// step chose not to emit it.
#[derive(Debug, Clone)]
pub struct ComputeResult {
    pub success: bool,
    pub outputs: BTreeMap<String, Emitted>,
}

impl ComputeResult {
    pub fn success(outputs: BTreeMap<String, Emitted>) -> Self {
        Self {
            success: true,
            outputs,
        }
    }

    /// Success with a single `Value` per output name.
    pub fn values(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self::success(
            pairs
                .into_iter()
                .map(|(name, value)| (name, Emitted::Single(value)))
                .collect(),
        )
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            outputs: BTreeMap::new(),
        }
    }

    /// Flat emitted output names, keyed instances as `name[key]`.
    pub fn emitted_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for (name, emitted) in &self.outputs {
            match emitted {
                Emitted::Single(_) => {
                    names.insert(name.clone());
                }
                Emitted::Keyed(map) => {
                    for key in map.keys() {
                        names.insert(format!("{name}[{key}]"));
                    }
                }
            }
        }
        names
    }
}

/// Executes the user-defined body of a step.
#[async_trait]
pub trait Compute: Send + Sync {
    async fn execute(
        &self,
        step: &ExecutionStep,
        inputs: BTreeMap<String, Value>,
    ) -> ComputeResult;
}

type ComputeFn =
    Arc<dyn Fn(&ExecutionStep, BTreeMap<String, Value>) -> ComputeResult + Send + Sync>;

/// Closure-backed compute registry keyed by invocation name. Clones of a
/// mapping group share the invocation's function.
#[derive(Clone, Default)]
pub struct FnCompute {
    fns: BTreeMap<String, ComputeFn>,
}

impl FnCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, node: &str, f: F) -> Self
    where
        F: Fn(&ExecutionStep, BTreeMap<String, Value>) -> ComputeResult + Send + Sync + 'static,
    {
        self.fns.insert(node.to_string(), Arc::new(f));
        self
    }
}

#[async_trait]
impl Compute for FnCompute {
    async fn execute(
        &self,
        step: &ExecutionStep,
        inputs: BTreeMap<String, Value>,
    ) -> ComputeResult {
        match self.fns.get(&step.node) {
            Some(f) => f(step, inputs),
            None => ComputeResult::failure(),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact store
// ---------------------------------------------------------------------------

/// Content-addressed output storage, keyed by run, step, and output instance.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn store(
        &self,
        run_id: Uuid,
        step: &str,
        output: &str,
        value: Value,
    ) -> Result<ArtifactHandle>;

    async fn load(&self, handle: &ArtifactHandle) -> Result<Value>;

    async fn exists(&self, handle: &ArtifactHandle) -> bool;
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    inner: RwLock<BTreeMap<(Uuid, StepKey, String), Value>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn store(
        &self,
        run_id: Uuid,
        step: &str,
        output: &str,
        value: Value,
    ) -> Result<ArtifactHandle> {
        self.inner
            .write()
            .await
            .insert((run_id, step.to_string(), output.to_string()), value);
        Ok(ArtifactHandle {
            run_id,
            step: step.to_string(),
            output: output.to_string(),
        })
    }

    async fn load(&self, handle: &ArtifactHandle) -> Result<Value> {
        self.inner
            .read()
            .await
            .get(&(
                handle.run_id,
                handle.step.clone(),
                handle.output.clone(),
            ))
            .cloned()
            .ok_or_else(|| CascadeError::Other(format!("artifact not found: {handle}")))
    }

    async fn exists(&self, handle: &ArtifactHandle) -> bool {
        self.inner.read().await.contains_key(&(
            handle.run_id,
            handle.step.clone(),
            handle.output.clone(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Run store
// ---------------------------------------------------------------------------

/// Append-only persistence for run metadata and event logs. The engine
/// writes each run once, live events in between, and only ever reads back
/// finalized records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Register a run before its first step executes.
    async fn create_run(&self, run_id: Uuid, parent_run_id: Option<Uuid>) -> Result<()>;

    /// Append one step transition to a live run's event log.
    async fn append_event(&self, run_id: Uuid, event: RunEvent) -> Result<()>;

    /// Seal the run with its final record.
    async fn finalize_run(&self, record: RunRecord) -> Result<()>;

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord>;
}

#[derive(Default)]
pub struct MemoryRunStore {
    live: RwLock<BTreeMap<Uuid, Vec<RunEvent>>>,
    finished: RwLock<BTreeMap<Uuid, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run_id: Uuid, _parent_run_id: Option<Uuid>) -> Result<()> {
        self.live.write().await.insert(run_id, Vec::new());
        Ok(())
    }

    async fn append_event(&self, run_id: Uuid, event: RunEvent) -> Result<()> {
        self.live
            .write()
            .await
            .get_mut(&run_id)
            .ok_or(CascadeError::UnknownRun { run_id })?
            .push(event);
        Ok(())
    }

    async fn finalize_run(&self, record: RunRecord) -> Result<()> {
        self.live.write().await.remove(&record.run_id);
        self.finished.write().await.insert(record.run_id, record);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord> {
        self.finished
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(CascadeError::UnknownRun { run_id })
    }
}
