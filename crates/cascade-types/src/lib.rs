//! Shared types, errors, statuses, and run configuration for the cascade
//! execution engine.
//!
//! This crate provides the foundational types used across the other cascade
//! crates:
//! - `CascadeError` — unified error taxonomy
//! - `SemanticType` — closed set of value type tags checked at compile time
//! - `StepStatus` / `SkipReason` — the step life cycle state machine
//! - `RunConfig` — literal input stubs and run-level policy knobs
//! - `ArtifactHandle` — address of a stored step output

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Addressable identifier of one compiled execution step.
///
/// Static steps use their node invocation name; dynamically fanned-out clones
/// append a mapping key suffix, e.g. `transform[north]`.
pub type StepKey = String;

/// Unified error type for all cascade subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    // === Structural errors (graph construction / validation) ===
    #[error("Dependency cycle detected through node '{node}'")]
    CycleDetected { node: String },

    #[error("Unknown node '{node}'")]
    UnknownNode { node: String },

    #[error("Node '{node}' has no input named '{input}'")]
    UnknownInput { node: String, input: String },

    #[error("Node '{node}' has no output named '{output}'")]
    UnknownOutput { node: String, output: String },

    #[error(
        "Type mismatch: output '{from_node}.{output}' is {found} but input '{to_node}.{input}' expects {expected}"
    )]
    TypeMismatch {
        from_node: String,
        output: String,
        to_node: String,
        input: String,
        expected: SemanticType,
        found: SemanticType,
    },

    #[error("Ordering dependency set for '{node}.{input}' is empty")]
    EmptyOrderingSet { node: String, input: String },

    #[error(
        "Dynamic output '{node}.{output}' must be consumed through a mapped input or a collect join"
    )]
    UnmappedDynamicOutput { node: String, output: String },

    #[error("Invocation name '{invocation}' is already taken in this graph")]
    DuplicateInvocation { invocation: String },

    // === Compile-time errors ===
    #[error("Required input '{node}.{input}' has no source after applying run config")]
    UnresolvedInput { node: String, input: String },

    #[error("Invalid mapping key '{key}' for step '{step}': {reason}")]
    InvalidMappingKey {
        step: StepKey,
        key: String,
        reason: String,
    },

    #[error("Node '{node}' declares a dynamic output inside a mapping group; nested fan-out is not supported")]
    NestedDynamicOutput { node: String },

    #[error("Mapped invocation '{node}' has no upstream dynamic output to map over")]
    MissingDynamicProducer { node: String },

    #[error("Mapped invocation '{node}' maps over more than one dynamic output")]
    AmbiguousDynamicProducer { node: String },

    // === Selection errors ===
    #[error("Selection token '{token}' names no step or node in the plan")]
    UnknownSelection { token: String },

    // === Re-execution errors ===
    #[error("Parent artifact for '{step}.{output}' of run {parent_run_id} no longer exists")]
    StaleParentArtifact {
        step: StepKey,
        output: String,
        parent_run_id: Uuid,
    },

    #[error("No run found with id {run_id}")]
    UnknownRun { run_id: Uuid },

    // === Scheduler errors ===
    #[error("Illegal status transition for step '{step}': {from} -> {to}")]
    IllegalTransition {
        step: StepKey,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Step '{step}' is not part of the execution plan")]
    UnknownStep { step: StepKey },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CascadeError {
    /// Returns `true` for defects in the graph itself: cycles, unknown
    /// references, and type mismatches. Always fatal at compile time.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CascadeError::CycleDetected { .. }
                | CascadeError::UnknownNode { .. }
                | CascadeError::UnknownInput { .. }
                | CascadeError::UnknownOutput { .. }
                | CascadeError::TypeMismatch { .. }
                | CascadeError::EmptyOrderingSet { .. }
                | CascadeError::UnmappedDynamicOutput { .. }
                | CascadeError::DuplicateInvocation { .. }
        )
    }

    /// Returns `true` if the error halts planning before any step runs.
    pub fn is_planning(&self) -> bool {
        self.is_structural()
            || matches!(
                self,
                CascadeError::UnresolvedInput { .. }
                    | CascadeError::InvalidMappingKey { .. }
                    | CascadeError::NestedDynamicOutput { .. }
                    | CascadeError::MissingDynamicProducer { .. }
                    | CascadeError::AmbiguousDynamicProducer { .. }
                    | CascadeError::StaleParentArtifact { .. }
                    | CascadeError::UnknownRun { .. }
            )
    }
}

/// A convenience alias for `Result<T, CascadeError>`.
pub type Result<T> = std::result::Result<T, CascadeError>;

// ---------------------------------------------------------------------------
// SemanticType — closed set of value type tags
// ---------------------------------------------------------------------------

/// Semantic type tag attached to every input and output definition.
///
/// `Any` is the explicit escape hatch: it accepts and is accepted by every
/// other tag. `Nothing` marks ordering-only (no-data) inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Any,
    String,
    Int,
    Float,
    Bool,
    Json,
    Nothing,
}

impl SemanticType {
    /// Whether a value of type `other` may flow into a slot of type `self`.
    pub fn accepts(&self, other: SemanticType) -> bool {
        *self == SemanticType::Any || other == SemanticType::Any || *self == other
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SemanticType::Any => "any",
            SemanticType::String => "string",
            SemanticType::Int => "int",
            SemanticType::Float => "float",
            SemanticType::Bool => "bool",
            SemanticType::Json => "json",
            SemanticType::Nothing => "nothing",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// StepStatus / SkipReason — step life cycle
// ---------------------------------------------------------------------------

/// Why a step was skipped instead of executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A consumed optional output was legally not emitted upstream.
    OutputNotEmitted,
    /// An upstream data dependency failed (directly or transitively).
    UpstreamFailure,
    /// The run was cancelled before the step became ready.
    Cancelled,
}

/// Status of one execution step.
///
/// Transitions are monotonic: `Pending -> Ready -> Running` and from any
/// non-terminal status into exactly one of the three terminal statuses.
/// No status ever regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped(_)
        )
    }

    /// Monotonic transition check. Self-transitions are not allowed; the
    /// scheduler records each status exactly once.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match (self, next) {
            (StepStatus::Pending, StepStatus::Ready) => true,
            (StepStatus::Pending, StepStatus::Skipped(_)) => true,
            (StepStatus::Pending, StepStatus::Succeeded) => true, // reused steps
            (StepStatus::Ready, StepStatus::Running) => true,
            (StepStatus::Ready, StepStatus::Skipped(SkipReason::Cancelled)) => true,
            (StepStatus::Running, StepStatus::Succeeded) => true,
            (StepStatus::Running, StepStatus::Failed) => true,
            (StepStatus::Running, StepStatus::Skipped(SkipReason::Cancelled)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Ready => write!(f, "ready"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped(SkipReason::OutputNotEmitted) => {
                write!(f, "skipped(output_not_emitted)")
            }
            StepStatus::Skipped(SkipReason::UpstreamFailure) => {
                write!(f, "skipped(upstream_failure)")
            }
            StepStatus::Skipped(SkipReason::Cancelled) => write!(f, "skipped(cancelled)"),
        }
    }
}

// ---------------------------------------------------------------------------
// RunConfig — literal stubs and run-level policy
// ---------------------------------------------------------------------------

/// What to do when a node completes successfully but omits a required
/// (non-optional) output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingOutputPolicy {
    /// Treat the omission as a hard step failure.
    #[default]
    FailStep,
    /// Record the step as succeeded; downstream consumers of the missing
    /// output are skipped as if it were optional.
    SkipDownstream,
}

/// Run-scoped configuration: literal values for inputs the graph leaves
/// unwired, keyed `"invocation.input"`, plus policy knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    pub inputs: HashMap<String, serde_json::Value>,
    pub missing_output_policy: MissingOutputPolicy,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a literal stub for `"<node>.<input>"`.
    pub fn with_input(
        mut self,
        node: impl Into<String>,
        input: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.inputs
            .insert(format!("{}.{}", node.into(), input.into()), value);
        self
    }

    pub fn with_missing_output_policy(mut self, policy: MissingOutputPolicy) -> Self {
        self.missing_output_policy = policy;
        self
    }

    /// Look up a literal stub for `node.input`.
    pub fn input(&self, node: &str, input: &str) -> Option<&serde_json::Value> {
        self.inputs.get(&format!("{node}.{input}"))
    }
}

// ---------------------------------------------------------------------------
// ArtifactHandle — address of a stored step output
// ---------------------------------------------------------------------------

/// Opaque address returned by the artifact collaborator when a step output is
/// stored. Handles are stable across re-executions so a derived run can load
/// a parent run's artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub run_id: Uuid,
    pub step: StepKey,
    pub output: String,
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.step, self.output)
    }
}
