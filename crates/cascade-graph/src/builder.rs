//! Registration API producing immutable [`GraphDef`]s.
//!
//! The decorator-style authoring surface lives outside this crate; callers
//! register node definitions and wire dependencies explicitly. Cycles, unknown
//! references, and type mismatches are rejected as edges are added, so a
//! builder never holds an ill-formed graph for long.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use cascade_types::{CascadeError, Result, SemanticType};

use crate::graph::{DependencySource, GraphDef};
use crate::node::NodeDef;

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: BTreeMap<String, NodeDef>,
    deps: BTreeMap<String, BTreeMap<String, DependencySource>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node under its own name. Reusing a definition auto-suffixes
    /// the invocation (`name_2`, `name_3`, ...). Returns the invocation name
    /// actually used.
    pub fn add_node(&mut self, def: NodeDef) -> String {
        let mut invocation = def.name.clone();
        let mut n = 1usize;
        while self.nodes.contains_key(&invocation) {
            n += 1;
            invocation = format!("{}_{n}", def.name);
        }
        self.nodes.insert(invocation.clone(), def);
        invocation
    }

    /// Register a node under an explicit invocation name. Fails when the name
    /// is already taken; aliased reuse requires distinct names.
    pub fn add_aliased(&mut self, def: NodeDef, invocation: impl Into<String>) -> Result<String> {
        let invocation = invocation.into();
        if self.nodes.contains_key(&invocation) {
            return Err(CascadeError::DuplicateInvocation { invocation });
        }
        self.nodes.insert(invocation.clone(), def);
        Ok(invocation)
    }

    /// Inline a sub-graph under `prefix`. Every invocation becomes
    /// `"<prefix>.<invocation>"` and internal edges are remapped accordingly.
    pub fn add_subgraph(&mut self, prefix: &str, sub: GraphDef) -> Result<()> {
        for invocation in sub.nodes.keys() {
            let qualified = format!("{prefix}.{invocation}");
            if self.nodes.contains_key(&qualified) {
                return Err(CascadeError::DuplicateInvocation {
                    invocation: qualified,
                });
            }
        }
        let qualify = |node: &str| format!("{prefix}.{node}");
        for (invocation, def) in sub.nodes {
            self.nodes.insert(qualify(&invocation), def);
        }
        for (consumer, inputs) in sub.deps {
            let remapped = inputs
                .into_iter()
                .map(|(input, source)| {
                    let source = match source {
                        DependencySource::Output { node, output } => DependencySource::Output {
                            node: qualify(&node),
                            output,
                        },
                        DependencySource::MappedOutput { node, output } => {
                            DependencySource::MappedOutput {
                                node: qualify(&node),
                                output,
                            }
                        }
                        DependencySource::Collected { node, output } => {
                            DependencySource::Collected {
                                node: qualify(&node),
                                output,
                            }
                        }
                        DependencySource::Ordering(nodes) => DependencySource::Ordering(
                            nodes.iter().map(|n| qualify(n)).collect(),
                        ),
                        literal @ DependencySource::Literal(_) => literal,
                    };
                    (input, source)
                })
                .collect();
            self.deps.insert(qualify(&consumer), remapped);
        }
        Ok(())
    }

    /// Wire one input of `consumer` to `source`.
    ///
    /// Fails with `CycleDetected` if the edge would close a cycle,
    /// `UnknownNode`/`UnknownInput`/`UnknownOutput` for undeclared references,
    /// and `TypeMismatch` when the declared types are incompatible.
    pub fn add_dependency(
        &mut self,
        consumer: &str,
        input: &str,
        source: DependencySource,
    ) -> Result<()> {
        let consumer_def = self
            .nodes
            .get(consumer)
            .ok_or_else(|| CascadeError::UnknownNode {
                node: consumer.to_string(),
            })?;
        let input_def = consumer_def
            .input(input)
            .ok_or_else(|| CascadeError::UnknownInput {
                node: consumer.to_string(),
                input: input.to_string(),
            })?
            .clone();

        match &source {
            DependencySource::Output { node, output }
            | DependencySource::MappedOutput { node, output }
            | DependencySource::Collected { node, output } => {
                let upstream_def =
                    self.nodes
                        .get(node)
                        .ok_or_else(|| CascadeError::UnknownNode {
                            node: node.clone(),
                        })?;
                let output_def =
                    upstream_def
                        .output(output)
                        .ok_or_else(|| CascadeError::UnknownOutput {
                            node: node.clone(),
                            output: output.clone(),
                        })?;
                // Ordering-only inputs never take data; Any does not override
                // that.
                if input_def.is_nothing() || !input_def.dtype.accepts(output_def.dtype) {
                    return Err(CascadeError::TypeMismatch {
                        from_node: node.clone(),
                        output: output.clone(),
                        to_node: consumer.to_string(),
                        input: input.to_string(),
                        expected: input_def.dtype,
                        found: output_def.dtype,
                    });
                }
            }
            DependencySource::Ordering(nodes) => {
                for node in nodes {
                    if !self.nodes.contains_key(node) {
                        return Err(CascadeError::UnknownNode { node: node.clone() });
                    }
                }
                if !input_def.is_nothing() {
                    return Err(CascadeError::TypeMismatch {
                        from_node: nodes.first().cloned().unwrap_or_default(),
                        output: String::new(),
                        to_node: consumer.to_string(),
                        input: input.to_string(),
                        expected: input_def.dtype,
                        found: SemanticType::Nothing,
                    });
                }
            }
            DependencySource::Literal(_) => {}
        }

        for upstream in source.upstream_nodes() {
            if upstream == consumer || self.reaches(upstream, consumer) {
                return Err(CascadeError::CycleDetected {
                    node: consumer.to_string(),
                });
            }
        }

        self.deps
            .entry(consumer.to_string())
            .or_default()
            .insert(input.to_string(), source);
        Ok(())
    }

    /// Whether `to` is an ancestor of `from` over already-registered edges.
    fn reaches(&self, from: &str, to: &str) -> bool {
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

    /// Finalize into an immutable [`GraphDef`], re-checking the assembled
    /// structure.
    pub fn build(self) -> Result<GraphDef> {
        let graph = self.build_unchecked();
        graph.check_structure()?;
        debug!(nodes = graph.nodes.len(), "Graph built");
        Ok(graph)
    }

    /// Finalize without the structural re-check. Test seam for exercising
    /// [`GraphDef::validate`] against ill-formed graphs.
    pub fn build_unchecked(self) -> GraphDef {
        GraphDef {
            nodes: self.nodes,
            deps: self.deps,
        }
    }
}
