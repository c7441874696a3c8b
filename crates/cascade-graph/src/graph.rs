//! The immutable graph model: a DAG of node invocations connected by data and
//! ordering dependencies.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use cascade_types::{CascadeError, Result, RunConfig};

use crate::node::NodeDef;

/// Where one input of one invocation gets its value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencySource {
    /// A single upstream output, one value.
    Output { node: String, output: String },
    /// A dynamic upstream output consumed one keyed instance at a time; the
    /// consumer is cloned once per mapping key during plan expansion.
    MappedOutput { node: String, output: String },
    /// Fan-in join over every keyed instance of a dynamic mapping group.
    Collected { node: String, output: String },
    /// A literal baked into the graph.
    Literal(serde_json::Value),
    /// No-data dependency on a set of upstream invocations.
    Ordering(Vec<String>),
}

impl DependencySource {
    /// Upstream invocation names this source depends on.
    pub fn upstream_nodes(&self) -> Vec<&str> {
        match self {
            DependencySource::Output { node, .. }
            | DependencySource::MappedOutput { node, .. }
            | DependencySource::Collected { node, .. } => vec![node.as_str()],
            DependencySource::Ordering(nodes) => nodes.iter().map(String::as_str).collect(),
            DependencySource::Literal(_) => vec![],
        }
    }

    /// Whether this source carries data (as opposed to ordering only).
    pub fn is_data(&self) -> bool {
        !matches!(
            self,
            DependencySource::Ordering(_) | DependencySource::Literal(_)
        )
    }
}

/// Immutable graph of node invocations and their dependency map.
///
/// Construct through [`crate::GraphBuilder`]; the builder rejects cycles and
/// unknown references as edges are added, and `build()` re-checks the full
/// structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDef {
    pub(crate) nodes: BTreeMap<String, NodeDef>,
    /// invocation -> input name -> source
    pub(crate) deps: BTreeMap<String, BTreeMap<String, DependencySource>>,
}

impl GraphDef {
    pub fn node(&self, invocation: &str) -> Option<&NodeDef> {
        self.nodes.get(invocation)
    }

    pub fn invocations(&self) -> impl Iterator<Item = (&String, &NodeDef)> {
        self.nodes.iter()
    }

    pub fn dependencies_of(&self, invocation: &str) -> Option<&BTreeMap<String, DependencySource>> {
        self.deps.get(invocation)
    }

    pub fn dependency(&self, invocation: &str, input: &str) -> Option<&DependencySource> {
        self.deps.get(invocation).and_then(|m| m.get(input))
    }

    /// Direct upstream invocations reachable over data edges only.
    pub fn data_parents(&self, invocation: &str) -> BTreeSet<String> {
        self.deps
            .get(invocation)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|s| s.is_data())
            .flat_map(|s| s.upstream_nodes())
            .map(String::from)
            .collect()
    }

    /// Direct downstream invocations reachable over data edges only.
    pub fn data_children(&self, invocation: &str) -> BTreeSet<String> {
        self.deps
            .iter()
            .filter(|(_, inputs)| {
                inputs
                    .values()
                    .filter(|s| s.is_data())
                    .any(|s| s.upstream_nodes().contains(&invocation))
            })
            .map(|(consumer, _)| consumer.clone())
            .collect()
    }

    /// Transitive data-dependency descendants, excluding `invocation` itself.
    pub fn downstream_of(&self, invocation: &str) -> BTreeSet<String> {
        self.traverse(invocation, |g, n| g.data_children(n))
    }

    /// Transitive data-dependency ancestors, excluding `invocation` itself.
    pub fn upstream_of(&self, invocation: &str) -> BTreeSet<String> {
        self.traverse(invocation, |g, n| g.data_parents(n))
    }

    fn traverse(
        &self,
        start: &str,
        neighbors: impl Fn(&GraphDef, &str) -> BTreeSet<String>,
    ) -> BTreeSet<String> {
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

    /// Whether `to` is reachable from `from` over dependency edges (data and
    /// ordering alike). Used by the builder's incremental cycle check.
    pub(crate) fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            let parents = self
                .deps
                .get(&current)
                .into_iter()
                .flat_map(|m| m.values())
                .flat_map(|s| s.upstream_nodes());
            for parent in parents {
                if seen.insert(parent.to_string()) {
                    queue.push_back(parent.to_string());
                }
            }
        }
        false
    }

    /// Invocations with at least one mapped input, i.e. those cloned per
    /// mapping key when the upstream dynamic output is expanded.
    pub fn mapped_invocations(&self) -> BTreeSet<String> {
        self.deps
            .iter()
            .filter(|(_, inputs)| {
                inputs
                    .values()
                    .any(|s| matches!(s, DependencySource::MappedOutput { .. }))
            })
            .map(|(invocation, _)| invocation.clone())
            .collect()
    }

    /// Return the first structural defect, or success.
    ///
    /// Checks, in order: every required input is wired, defaulted,
    /// config-stubbed, or present in `config`; every ordering set is
    /// non-empty; dynamic outputs are consumed only through mapped inputs or
    /// collect joins; acyclicity over the dependency map.
    pub fn validate(&self, config: &RunConfig) -> Result<()> {
        for (invocation, node) in &self.nodes {
            for input in &node.inputs {
                if self.dependency(invocation, &input.name).is_some() || input.is_nothing() {
                    continue;
                }
                let resolvable = input.default.is_some()
                    || input.from_config
                    || config.input(invocation, &input.name).is_some();
                if !resolvable {
                    return Err(CascadeError::UnresolvedInput {
                        node: invocation.clone(),
                        input: input.name.clone(),
                    });
                }
            }
        }
        self.check_structure()
    }

    /// Config-independent structural checks, also run by the builder.
    pub(crate) fn check_structure(&self) -> Result<()> {
        let mapped = self.mapped_invocations();

        for (consumer, inputs) in &self.deps {
            for (input, source) in inputs {
                if let DependencySource::Ordering(nodes) = source {
                    if nodes.is_empty() {
                        return Err(CascadeError::EmptyOrderingSet {
                            node: consumer.clone(),
                            input: input.clone(),
                        });
                    }
                }
            }
        }

        // A dynamic output, or any output of a mapped invocation, fans out per
        // mapping key; consuming it as a plain single value is ill-formed.
        for inputs in self.deps.values() {
            for source in inputs.values() {
                if let DependencySource::Output { node, output } = source {
                    let dynamic = self
                        .nodes
                        .get(node)
                        .and_then(|n| n.output(output))
                        .map(|o| o.is_dynamic)
                        .unwrap_or(false);
                    if dynamic || mapped.contains(node) {
                        return Err(CascadeError::UnmappedDynamicOutput {
                            node: node.clone(),
                            output: output.clone(),
                        });
                    }
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the full dependency map. The builder already
    /// rejects cycle-closing edges; this re-checks the assembled graph.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.nodes.keys().map(|n| (n.as_str(), 0)).collect();
        for (consumer, inputs) in &self.deps {
            let parents: BTreeSet<&str> = inputs
                .values()
                .flat_map(|s| s.upstream_nodes())
                .collect();
            if let Some(d) = in_degree.get_mut(consumer.as_str()) {
                *d += parents.len();
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0usize;
        while let Some(current) = queue.pop_front() {
            visited += 1;
            for (consumer, inputs) in &self.deps {
                let depends = inputs
                    .values()
                    .flat_map(|s| s.upstream_nodes())
                    .collect::<BTreeSet<_>>()
                    .contains(current);
                if depends {
                    let d = in_degree.get_mut(consumer.as_str()).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(consumer);
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(n, _)| n.to_string())
                .unwrap_or_default();
            return Err(CascadeError::CycleDetected { node: stuck });
        }
        Ok(())
    }
}
