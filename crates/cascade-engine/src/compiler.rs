//! Lowers a validated graph plus run config into an [`ExecutionPlan`], and
//! expands dynamic fan-out incrementally as cardinalities are discovered.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use cascade_graph::{DependencySource, GraphDef};
use cascade_types::{CascadeError, Result, RunConfig, StepKey};

use crate::plan::{ExecutionPlan, ExecutionStep, StepInput, StepInputSource, StepSource};

/// Compile a graph into the initial execution plan: one step per static
/// invocation, one template per mapped invocation.
///
/// Fails with the graph's first structural defect, or `UnresolvedInput` when
/// a required input still lacks a source after defaults and config stubs.
pub fn compile(graph: &GraphDef, config: &RunConfig) -> Result<ExecutionPlan> {
    graph.validate(config)?;

    let mapped = graph.mapped_invocations();
    let mut steps = BTreeMap::new();

    for (invocation, node) in graph.invocations() {
        let template = mapped.contains(invocation);
        let mapping_root = if template {
            Some(mapping_root(graph, invocation)?)
        } else {
            None
        };
        if template && node.outputs.iter().any(|o| o.is_dynamic) {
            return Err(CascadeError::NestedDynamicOutput {
                node: invocation.clone(),
            });
        }

        let mut inputs = Vec::new();
        for input_def in &node.inputs {
            let source = match graph.dependency(invocation, &input_def.name) {
                Some(DependencySource::Output { node, output }) => StepInputSource::FromOutput {
                    step: node.clone(),
                    output: output.clone(),
                },
                Some(DependencySource::MappedOutput { node, output }) => {
                    StepInputSource::FromMappedInstance {
                        node: node.clone(),
                        output: output.clone(),
                    }
                }
                Some(DependencySource::Collected { node, output }) => {
                    if mapped.contains(node) {
                        StepInputSource::PendingFanIn {
                            node: node.clone(),
                            output: output.clone(),
                        }
                    } else {
                        // Collect directly over a dynamic output: one
                        // upstream step, all keyed instances.
                        StepInputSource::FanIn {
                            node: node.clone(),
                            steps: vec![node.clone()],
                            output: output.clone(),
                        }
                    }
                }
                Some(DependencySource::Literal(value)) => StepInputSource::Literal(value.clone()),
                Some(DependencySource::Ordering(nodes)) => StepInputSource::Ordering {
                    nodes: nodes.clone(),
                },
                None => {
                    if input_def.is_nothing() {
                        continue;
                    }
                    match config
                        .input(invocation, &input_def.name)
                        .or(input_def.default.as_ref())
                    {
                        Some(value) => StepInputSource::Literal(value.clone()),
                        None => {
                            return Err(CascadeError::UnresolvedInput {
                                node: invocation.clone(),
                                input: input_def.name.clone(),
                            })
                        }
                    }
                }
            };
            inputs.push(StepInput {
                name: input_def.name.clone(),
                source,
            });
        }

        steps.insert(
            invocation.clone(),
            ExecutionStep {
                key: invocation.clone(),
                node: invocation.clone(),
                mapping_key: None,
                template,
                mapping_root,
                inputs,
                outputs: node.outputs.clone(),
                source: StepSource::Fresh,
            },
        );
    }

    let plan = ExecutionPlan::new(steps);
    debug!(steps = plan.all_steps().count(), "Compiled execution plan");
    Ok(plan)
}

/// Resolve the dynamic producer that governs a mapped invocation, following
/// mapped edges up through the mapping group.
fn mapping_root(graph: &GraphDef, invocation: &str) -> Result<StepKey> {
    let mapped = graph.mapped_invocations();
    let mut roots = BTreeSet::new();
    let deps = graph.dependencies_of(invocation).cloned().unwrap_or_default();
    for source in deps.values() {
        if let DependencySource::MappedOutput { node, output } = source {
            let dynamic = graph
                .node(node)
                .and_then(|n| n.output(output))
                .map(|o| o.is_dynamic)
                .unwrap_or(false);
            if dynamic {
                roots.insert(node.clone());
            } else if mapped.contains(node) {
                // Fellow member of the mapping group; keep climbing.
                roots.insert(mapping_root(graph, node)?);
            } else {
                return Err(CascadeError::MissingDynamicProducer {
                    node: invocation.to_string(),
                });
            }
        }
    }
    match roots.len() {
        1 => Ok(roots.into_iter().next().unwrap()),
        0 => Err(CascadeError::MissingDynamicProducer {
            node: invocation.to_string(),
        }),
        _ => Err(CascadeError::AmbiguousDynamicProducer {
            node: invocation.to_string(),
        }),
    }
}

/// Reduce a mapping key to `[A-Za-z0-9_]`; every other character becomes an
/// underscore.
pub fn sanitize_mapping_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Derived step key for one clone of a mapping group.
pub fn clone_key(base: &str, mapping_key: &str) -> StepKey {
    format!("{base}[{mapping_key}]")
}

/// Incremental re-compilation after a dynamic producer yields its keys.
///
/// Every template governed by `producer` is replaced with one clone per
/// mapping key, clone inputs are rewritten to the keyed upstream instances,
/// and pending fan-in joins over the group are resolved to the full sibling
/// list. Returns the newly created step keys.
pub fn expand_dynamic(
    plan: &mut ExecutionPlan,
    producer: &str,
    output: &str,
    keys: &[String],
) -> Result<Vec<StepKey>> {
    if plan.step(producer).is_none() {
        return Err(CascadeError::UnknownStep {
            step: producer.to_string(),
        });
    }

    // Sanitize up front; collisions after sanitization abort the expansion.
    let mut sanitized = Vec::with_capacity(keys.len());
    let mut seen = BTreeSet::new();
    for key in keys {
        let clean = sanitize_mapping_key(key);
        if clean.is_empty() {
            return Err(CascadeError::InvalidMappingKey {
                step: producer.to_string(),
                key: key.clone(),
                reason: "empty after sanitization".into(),
            });
        }
        if !seen.insert(clean.clone()) {
            return Err(CascadeError::InvalidMappingKey {
                step: producer.to_string(),
                key: key.clone(),
                reason: format!("collides with '{clean}' after sanitization"),
            });
        }
        sanitized.push(clean);
    }

    let templates: Vec<ExecutionStep> = plan
        .steps
        .values()
        .filter(|s| s.template && s.mapping_root.as_deref() == Some(producer))
        .cloned()
        .collect();
    for template in &templates {
        if plan.expanded.contains(&template.key) {
            return Err(CascadeError::InvalidMappingKey {
                step: producer.to_string(),
                key: String::new(),
                reason: format!("mapping group '{}' is already expanded", template.key),
            });
        }
    }

    let mut new_keys = Vec::new();
    for template in &templates {
        let mut clone_keys = Vec::with_capacity(sanitized.len());
        for mapping_key in &sanitized {
            let key = clone_key(&template.key, mapping_key);
            if plan.steps.contains_key(&key) {
                return Err(CascadeError::InvalidMappingKey {
                    step: template.key.clone(),
                    key: mapping_key.clone(),
                    reason: "derived step key already exists in the plan".into(),
                });
            }

            let inputs = template
                .inputs
                .iter()
                .map(|input| {
                    let source = match &input.source {
                        StepInputSource::FromMappedInstance { node, output: o } => {
                            if node == producer {
                                // Directly downstream of the dynamic output:
                                // read instance `o[key]` of the producer.
                                StepInputSource::FromOutput {
                                    step: producer.to_string(),
                                    output: format!("{o}[{mapping_key}]"),
                                }
                            } else {
                                // Fellow member of the mapping group: read the
                                // same-keyed clone.
                                StepInputSource::FromOutput {
                                    step: clone_key(node, mapping_key),
                                    output: o.clone(),
                                }
                            }
                        }
                        other => other.clone(),
                    };
                    StepInput {
                        name: input.name.clone(),
                        source,
                    }
                })
                .collect();

            plan.steps.insert(
                key.clone(),
                ExecutionStep {
                    key: key.clone(),
                    node: template.node.clone(),
                    mapping_key: Some(mapping_key.clone()),
                    template: false,
                    mapping_root: template.mapping_root.clone(),
                    inputs,
                    outputs: template.outputs.clone(),
                    source: template.source.clone(),
                },
            );
            clone_keys.push(key.clone());
            new_keys.push(key);
        }
        plan.expanded.insert(template.key.clone());
        plan.node_steps
            .insert(template.node.clone(), clone_keys);
    }

    // Resolve fan-in joins over the now-expanded groups.
    let expanded_nodes: BTreeSet<String> = templates.iter().map(|t| t.node.clone()).collect();
    for step in plan.steps.values_mut() {
        for input in &mut step.inputs {
            if let StepInputSource::PendingFanIn { node, output: o } = &input.source {
                if expanded_nodes.contains(node) {
                    input.source = StepInputSource::FanIn {
                        node: node.clone(),
                        steps: sanitized.iter().map(|k| clone_key(node, k)).collect(),
                        output: o.clone(),
                    };
                }
            }
        }
    }

    debug!(
        producer,
        output,
        clones = new_keys.len(),
        "Expanded dynamic mapping group"
    );
    Ok(new_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_graph::{GraphBuilder, InputDef, NodeDef, OutputDef};
    use cascade_types::SemanticType;

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

    /// fan (dynamic items) -> each (mapped) -> total (collect over each.out)
    fn fan_out_graph() -> GraphDef {
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
        builder.build().unwrap()
    }

    #[test]
    fn compile_emits_one_step_per_static_invocation() {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::source("a", "out"));
        builder.add_node(passthrough("b"));
        builder.add_dependency("b", "in", out_of("a")).unwrap();
        let plan = compile(&builder.build().unwrap(), &RunConfig::new()).unwrap();

        assert_eq!(plan.all_steps().count(), 2);
        let b = plan.step("b").unwrap();
        assert!(!b.template);
        assert!(matches!(
            &b.inputs[0].source,
            StepInputSource::FromOutput { step, output } if step == "a" && output == "out"
        ));
    }

    #[test]
    fn compile_resolves_defaults_and_config_stubs() {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::new(
            "node",
            vec![
                InputDef::new("defaulted", SemanticType::Int).with_default(serde_json::json!(7)),
                InputDef::new("configured", SemanticType::Int).from_config(),
            ],
            vec![],
        ));
        let graph = builder.build().unwrap();
        let config = RunConfig::new().with_input("node", "configured", serde_json::json!(9));
        let plan = compile(&graph, &config).unwrap();

        let step = plan.step("node").unwrap();
        assert!(matches!(
            &step.input("defaulted").unwrap().source,
            StepInputSource::Literal(v) if *v == serde_json::json!(7)
        ));
        assert!(matches!(
            &step.input("configured").unwrap().source,
            StepInputSource::Literal(v) if *v == serde_json::json!(9)
        ));
    }

    #[test]
    fn config_stub_overrides_default() {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::new(
            "node",
            vec![InputDef::new("in", SemanticType::Int).with_default(serde_json::json!(1))],
            vec![],
        ));
        let graph = builder.build().unwrap();
        let config = RunConfig::new().with_input("node", "in", serde_json::json!(2));
        let plan = compile(&graph, &config).unwrap();
        assert!(matches!(
            &plan.step("node").unwrap().inputs[0].source,
            StepInputSource::Literal(v) if *v == serde_json::json!(2)
        ));
    }

    #[test]
    fn compile_fails_on_unresolved_config_stub() {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::new(
            "node",
            vec![InputDef::new("in", SemanticType::Int).from_config()],
            vec![],
        ));
        let graph = builder.build().unwrap();

        let err = compile(&graph, &RunConfig::new()).unwrap_err();
        assert!(matches!(err, CascadeError::UnresolvedInput { .. }));
    }

    #[test]
    fn mapped_consumers_compile_to_templates() {
        let plan = compile(&fan_out_graph(), &RunConfig::new()).unwrap();

        let each = plan.step("each").unwrap();
        assert!(each.template);
        assert_eq!(each.mapping_root.as_deref(), Some("fan"));

        let total = plan.step("total").unwrap();
        assert!(!total.template);
        assert!(matches!(
            &total.inputs[0].source,
            StepInputSource::PendingFanIn { node, .. } if node == "each"
        ));
    }

    #[test]
    fn expansion_clones_templates_and_resolves_fan_in() {
        let mut plan = compile(&fan_out_graph(), &RunConfig::new()).unwrap();
        let keys: Vec<String> = ["x", "y", "z"].map(String::from).to_vec();
        let new = expand_dynamic(&mut plan, "fan", "items", &keys).unwrap();

        assert_eq!(
            new,
            vec!["each[x]".to_string(), "each[y]".to_string(), "each[z]".to_string()]
        );
        assert!(!plan.is_live("each"));
        assert_eq!(plan.steps_for_node("each").len(), 3);

        let clone = plan.step("each[y]").unwrap();
        assert_eq!(clone.mapping_key.as_deref(), Some("y"));
        assert!(matches!(
            &clone.inputs[0].source,
            StepInputSource::FromOutput { step, output }
                if step == "fan" && output == "items[y]"
        ));

        let total = plan.step("total").unwrap();
        match &total.inputs[0].source {
            StepInputSource::FanIn {
                node,
                steps,
                output,
            } => {
                assert_eq!(node, "each");
                assert_eq!(steps.len(), 3);
                assert_eq!(output, "out");
                assert!(steps.contains(&"each[x]".to_string()));
            }
            other => panic!("fan-in not resolved: {other:?}"),
        }
    }

    #[test]
    fn expansion_with_zero_keys_resolves_empty_fan_in() {
        let mut plan = compile(&fan_out_graph(), &RunConfig::new()).unwrap();
        let new = expand_dynamic(&mut plan, "fan", "items", &[]).unwrap();
        assert!(new.is_empty());
        assert!(!plan.is_live("each"));
        assert!(matches!(
            &plan.step("total").unwrap().inputs[0].source,
            StepInputSource::FanIn { node, steps, .. } if node == "each" && steps.is_empty()
        ));
        // Even with no clones the join stays a data descendant of the
        // producer.
        assert!(plan.data_parents("total").contains("fan"));
        assert!(plan.downstream_of("fan").contains("total"));
    }

    #[test]
    fn nested_dynamic_output_rejected() {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::new(
            "fan",
            vec![],
            vec![OutputDef::new("items", SemanticType::Json).dynamic()],
        ));
        builder.add_node(NodeDef::new(
            "each",
            vec![InputDef::new("in", SemanticType::Any)],
            vec![OutputDef::new("more", SemanticType::Json).dynamic()],
        ));
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
                    output: "more".into(),
                },
            )
            .unwrap();
        let graph = builder.build().unwrap();

        let err = compile(&graph, &RunConfig::new()).unwrap_err();
        assert!(matches!(
            err,
            CascadeError::NestedDynamicOutput { node } if node == "each"
        ));
    }

    #[test]
    fn mapping_over_static_output_rejected() {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::source("plain", "out"));
        builder.add_node(passthrough("each"));
        builder
            .add_dependency(
                "each",
                "in",
                DependencySource::MappedOutput {
                    node: "plain".into(),
                    output: "out".into(),
                },
            )
            .unwrap();
        let graph = builder.build().unwrap();

        let err = compile(&graph, &RunConfig::new()).unwrap_err();
        assert!(matches!(
            err,
            CascadeError::MissingDynamicProducer { node } if node == "each"
        ));
    }

    #[test]
    fn mapping_over_two_dynamic_outputs_rejected() {
        let mut builder = GraphBuilder::new();
        for name in ["left", "right"] {
            builder.add_node(NodeDef::new(
                name,
                vec![],
                vec![OutputDef::new("items", SemanticType::Json).dynamic()],
            ));
        }
        builder.add_node(NodeDef::new(
            "each",
            vec![
                InputDef::new("a", SemanticType::Any),
                InputDef::new("b", SemanticType::Any),
            ],
            vec![OutputDef::new("out", SemanticType::Any)],
        ));
        for (input, node) in [("a", "left"), ("b", "right")] {
            builder
                .add_dependency(
                    "each",
                    input,
                    DependencySource::MappedOutput {
                        node: node.into(),
                        output: "items".into(),
                    },
                )
                .unwrap();
        }
        let graph = builder.build().unwrap();

        let err = compile(&graph, &RunConfig::new()).unwrap_err();
        assert!(matches!(
            err,
            CascadeError::AmbiguousDynamicProducer { node } if node == "each"
        ));
    }

    #[test]
    fn mapping_keys_sanitized() {
        assert_eq!(sanitize_mapping_key("region/us-east"), "region_us_east");
        assert_eq!(sanitize_mapping_key("plain_01"), "plain_01");
    }

    #[test]
    fn colliding_mapping_keys_rejected() {
        let mut plan = compile(&fan_out_graph(), &RunConfig::new()).unwrap();
        let keys: Vec<String> = ["a/b", "a.b"].map(String::from).to_vec();
        let err = expand_dynamic(&mut plan, "fan", "items", &keys).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidMappingKey { .. }));
    }

    #[test]
    fn empty_mapping_key_rejected() {
        let mut plan = compile(&fan_out_graph(), &RunConfig::new()).unwrap();
        let err = expand_dynamic(&mut plan, "fan", "items", &["...".to_string()]);
        // "..." sanitizes to "___", which is fine; "" is not.
        assert!(err.is_ok());
        let mut plan = compile(&fan_out_graph(), &RunConfig::new()).unwrap();
        let err = expand_dynamic(&mut plan, "fan", "items", &["".to_string()]).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidMappingKey { .. }));
    }

    #[test]
    fn transitive_mapping_groups_share_the_root() {
        // fan -> first (mapped) -> second (mapped over first.out)
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeDef::new(
            "fan",
            vec![],
            vec![OutputDef::new("items", SemanticType::Json).dynamic()],
        ));
        builder.add_node(passthrough("first"));
        builder.add_node(passthrough("second"));
        builder
            .add_dependency(
                "first",
                "in",
                DependencySource::MappedOutput {
                    node: "fan".into(),
                    output: "items".into(),
                },
            )
            .unwrap();
        builder
            .add_dependency(
                "second",
                "in",
                DependencySource::MappedOutput {
                    node: "first".into(),
                    output: "out".into(),
                },
            )
            .unwrap();
        let graph = builder.build().unwrap();
        let mut plan = compile(&graph, &RunConfig::new()).unwrap();

        assert_eq!(plan.step("second").unwrap().mapping_root.as_deref(), Some("fan"));

        let keys: Vec<String> = ["a", "b"].map(String::from).to_vec();
        expand_dynamic(&mut plan, "fan", "items", &keys).unwrap();

        let second_a = plan.step("second[a]").unwrap();
        assert!(matches!(
            &second_a.inputs[0].source,
            StepInputSource::FromOutput { step, output }
                if step == "first[a]" && output == "out"
        ));
    }
}
