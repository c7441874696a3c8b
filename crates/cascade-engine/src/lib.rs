//! Plan compilation, scheduling, and execution for cascade graphs.
//!
//! The engine lowers a validated [`cascade_graph::GraphDef`] into an
//! [`ExecutionPlan`] of addressable steps, resolves readiness through a pure
//! polling scheduler, and coordinates compute and artifact storage behind
//! pluggable traits. Finished runs are recorded and can be partially
//! re-executed, replaying surviving artifacts instead of recomputing them.

pub mod collaborators;
pub mod compiler;
pub mod events;
pub mod executor;
pub mod plan;
pub mod reexecution;
pub mod run;
pub mod scheduler;
pub mod selection;

pub use collaborators::{
    ArtifactStore, Compute, ComputeResult, Emitted, FnCompute, MemoryArtifactStore,
    MemoryRunStore, RunStore,
};
pub use compiler::{compile, expand_dynamic};
pub use events::{EngineEvent, EventEmitter, RunEvent};
pub use executor::{CancelHandle, RunExecutor};
pub use plan::{ExecutionPlan, ExecutionStep, StepInput, StepInputSource, StepSource};
pub use reexecution::{plan_reexecution, verify_reused, ReexecutionMode};
pub use run::RunRecord;
pub use scheduler::{apply_outcome, poll, RunState, StepOutcome};
pub use selection::select;
