//! Node definitions: named computation units with typed inputs and outputs.

use serde::{Deserialize, Serialize};

use cascade_types::SemanticType;

/// One input slot of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDef {
    pub name: String,
    pub dtype: SemanticType,
    /// Fallback value used when the input is left unwired.
    pub default: Option<serde_json::Value>,
    /// Marks the input as satisfiable from run config even when unwired.
    pub from_config: bool,
}

impl InputDef {
    pub fn new(name: impl Into<String>, dtype: SemanticType) -> Self {
        Self {
            name: name.into(),
            dtype,
            default: None,
            from_config: false,
        }
    }

    /// Ordering-only input: carries no data, only a happens-before edge.
    pub fn nothing(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Nothing)
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn from_config(mut self) -> Self {
        self.from_config = true;
        self
    }

    /// Whether this input is a no-data (ordering-only) slot.
    pub fn is_nothing(&self) -> bool {
        self.dtype == SemanticType::Nothing
    }
}

/// One output slot of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    pub dtype: SemanticType,
    /// When `false` the node may legally decline to emit this output, and
    /// downstream consumers are skipped rather than failed.
    pub is_required: bool,
    /// When `true` the node yields zero or more keyed instances at runtime
    /// instead of a single value.
    pub is_dynamic: bool,
}

impl OutputDef {
    pub fn new(name: impl Into<String>, dtype: SemanticType) -> Self {
        Self {
            name: name.into(),
            dtype,
            is_required: true,
            is_dynamic: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self
    }
}

/// A named unit of computation. Immutable once constructed; identity is the
/// invocation name within the enclosing graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub inputs: Vec<InputDef>,
    pub outputs: Vec<OutputDef>,
}

impl NodeDef {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<InputDef>,
        outputs: Vec<OutputDef>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs,
        }
    }

    /// A node with a single untyped output and no inputs.
    pub fn source(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(
            name,
            vec![],
            vec![OutputDef::new(output, SemanticType::Any)],
        )
    }

    pub fn input(&self, name: &str) -> Option<&InputDef> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDef> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_builders_set_flags() {
        let input = InputDef::new("table", SemanticType::String)
            .with_default(serde_json::json!("events"))
            .from_config();
        assert_eq!(input.default, Some(serde_json::json!("events")));
        assert!(input.from_config);
        assert!(!input.is_nothing());
    }

    #[test]
    fn nothing_input_is_ordering_only() {
        let input = InputDef::nothing("after");
        assert!(input.is_nothing());
        assert_eq!(input.dtype, SemanticType::Nothing);
    }

    #[test]
    fn output_defaults_to_required_static() {
        let out = OutputDef::new("rows", SemanticType::Json);
        assert!(out.is_required);
        assert!(!out.is_dynamic);

        let opt = OutputDef::new("maybe", SemanticType::Json).optional().dynamic();
        assert!(!opt.is_required);
        assert!(opt.is_dynamic);
    }

    #[test]
    fn node_port_lookup() {
        let node = NodeDef::new(
            "transform",
            vec![InputDef::new("rows", SemanticType::Json)],
            vec![OutputDef::new("result", SemanticType::Json)],
        );
        assert!(node.input("rows").is_some());
        assert!(node.input("missing").is_none());
        assert!(node.output("result").is_some());
        assert!(node.output("rows").is_none());
    }
}
