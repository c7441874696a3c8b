//! The compiled execution plan: addressable steps with resolved input sources.
//!
//! A plan is produced by [`crate::compiler::compile`] and expanded in place by
//! [`crate::compiler::expand_dynamic`] as dynamic-output cardinalities are
//! discovered at runtime. Steps downstream of an unexpanded dynamic output are
//! held as *templates*: present in the plan for dependency bookkeeping, never
//! schedulable, and replaced by one clone per mapping key on expansion.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cascade_graph::OutputDef;
use cascade_types::StepKey;

/// Where one input of one step gets its value at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepInputSource {
    /// A single upstream step output. Keyed dynamic instances are addressed
    /// as `output[key]`.
    FromOutput { step: StepKey, output: String },
    /// Resolved fan-in join: one value per succeeded sibling. `node` is the
    /// joined invocation, kept so a zero-clone group still traces back to it.
    FanIn {
        node: String,
        steps: Vec<StepKey>,
        output: String,
    },
    /// Fan-in join awaiting expansion of the mapping group for `node`.
    PendingFanIn { node: String, output: String },
    /// Template-only: one keyed instance of a mapping group, rewritten to a
    /// concrete `FromOutput` per clone at expansion.
    FromMappedInstance { node: String, output: String },
    /// Literal from graph default or run config.
    Literal(serde_json::Value),
    /// No-data ordering constraint on every live step of the named
    /// invocations.
    Ordering { nodes: Vec<String> },
}

impl StepInputSource {
    /// Whether this source carries data (ordering constraints do not).
    pub fn is_data(&self) -> bool {
        !matches!(
            self,
            StepInputSource::Ordering { .. } | StepInputSource::Literal(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    pub source: StepInputSource,
}

/// Whether a step executes compute this run or replays a prior run's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSource {
    Fresh,
    /// Replay: outputs are loaded from `run_id`/`step` instead of executing.
    /// `outputs` is the set of output names the source run actually emitted.
    Reused {
        run_id: Uuid,
        step: StepKey,
        outputs: BTreeSet<String>,
    },
}

/// One addressable unit of work in a compiled plan. Immutable for the
/// lifetime of the plan apart from expansion rewrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub key: StepKey,
    /// Invocation name in the source graph (shared by all clones of a
    /// mapping group).
    pub node: String,
    /// Mapping key suffix for dynamically fanned-out clones.
    pub mapping_key: Option<String>,
    /// Unexpanded placeholder for a mapped invocation.
    pub template: bool,
    /// For templates and clones: step key of the dynamic producer whose
    /// expansion governs this step.
    pub mapping_root: Option<StepKey>,
    pub inputs: Vec<StepInput>,
    pub outputs: Vec<OutputDef>,
    pub source: StepSource,
}

impl ExecutionStep {
    pub fn input(&self, name: &str) -> Option<&StepInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDef> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn is_reused(&self) -> bool {
        matches!(self.source, StepSource::Reused { .. })
    }

    pub fn has_dynamic_output(&self) -> bool {
        self.outputs.iter().any(|o| o.is_dynamic)
    }
}

/// The flat, addressable set of steps for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub(crate) steps: BTreeMap<StepKey, ExecutionStep>,
    /// Live (schedulable or pending-expansion) step keys per invocation.
    pub(crate) node_steps: BTreeMap<String, Vec<StepKey>>,
    /// Template keys that have already been expanded.
    pub(crate) expanded: BTreeSet<StepKey>,
}

impl ExecutionPlan {
    pub(crate) fn new(steps: BTreeMap<StepKey, ExecutionStep>) -> Self {
        let mut node_steps: BTreeMap<String, Vec<StepKey>> = BTreeMap::new();
        for step in steps.values() {
            node_steps
                .entry(step.node.clone())
                .or_default()
                .push(step.key.clone());
        }
        Self {
            steps,
            node_steps,
            expanded: BTreeSet::new(),
        }
    }

    pub fn step(&self, key: &str) -> Option<&ExecutionStep> {
        self.steps.get(key)
    }

    /// Every step in the plan, expanded templates included.
    pub fn all_steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.steps.values()
    }

    /// Steps that participate in scheduling: everything except templates that
    /// have already been replaced by their clones.
    pub fn live_steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.steps
            .values()
            .filter(|s| !self.expanded.contains(&s.key))
    }

    pub fn is_live(&self, key: &str) -> bool {
        self.steps.contains_key(key) && !self.expanded.contains(key)
    }

    /// Live step keys for one invocation: the single static step, the
    /// template before expansion, or the clones after.
    pub fn steps_for_node(&self, node: &str) -> &[StepKey] {
        self.node_steps
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Live steps whose key or invocation name equals `name`.
    pub fn steps_matching(&self, name: &str) -> BTreeSet<StepKey> {
        let mut matches = BTreeSet::new();
        if self.is_live(name) {
            matches.insert(name.to_string());
        }
        for key in self.steps_for_node(name) {
            matches.insert(key.clone());
        }
        matches
    }

    /// Direct upstream live steps over data edges.
    pub fn data_parents(&self, key: &str) -> BTreeSet<StepKey> {
        let Some(step) = self.steps.get(key) else {
            return BTreeSet::new();
        };
        let mut parents = BTreeSet::new();
        for input in &step.inputs {
            match &input.source {
                StepInputSource::FromOutput { step, .. } => {
                    parents.insert(step.clone());
                }
                StepInputSource::FanIn { node, steps, .. } => {
                    parents.extend(steps.iter().cloned());
                    if steps.is_empty() {
                        // A zero-key group leaves no clones to join; anchor
                        // the edge to the dynamic producer so the join is
                        // still a data descendant of the expansion root.
                        if let Some(root) = self
                            .steps
                            .get(node)
                            .and_then(|s| s.mapping_root.clone())
                        {
                            parents.insert(root);
                        }
                    }
                }
                StepInputSource::PendingFanIn { node, .. }
                | StepInputSource::FromMappedInstance { node, .. } => {
                    parents.extend(self.steps_for_node(node).iter().cloned());
                }
                StepInputSource::Literal(_) | StepInputSource::Ordering { .. } => {}
            }
        }
        parents
    }

    /// Direct downstream live steps over data edges.
    pub fn data_children(&self, key: &str) -> BTreeSet<StepKey> {
        self.live_steps()
            .filter(|s| self.data_parents(&s.key).contains(key))
            .map(|s| s.key.clone())
            .collect()
    }

    /// Transitive data-dependency descendants of `key`, excluding `key`.
    pub fn downstream_of(&self, key: &str) -> BTreeSet<StepKey> {
        self.traverse(key, Self::data_children)
    }

    /// Transitive data-dependency ancestors of `key`, excluding `key`.
    pub fn upstream_of(&self, key: &str) -> BTreeSet<StepKey> {
        self.traverse(key, Self::data_parents)
    }

    fn traverse(
        &self,
        start: &str,
        neighbors: impl Fn(&Self, &str) -> BTreeSet<StepKey>,
    ) -> BTreeSet<StepKey> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(current) = queue.pop_front() {
            for next in neighbors(self, &current) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}
