//! Typed views over a normalized document tree.
//!
//! These structs are deserialized from the generic `Value` tree produced by the normalizer;
//! they exist purely to give the rest of the crate field access instead of repeated map
//! lookups. The document's own dynamism (arbitrary `type`/`outputBinding` shapes) is kept as
//! `serde_json::Value` where the shape genuinely varies.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkDoc {
    pub source: String,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputBindingDoc {
    pub glob: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TypeDoc {
    Name(String),
    Mapping {
        #[serde(rename = "type")]
        type_name: String,
        #[serde(default, rename = "outputBinding")]
        output_binding: Option<OutputBindingDoc>,
    },
}

impl TypeDoc {
    pub fn type_name(&self) -> &str {
        match self {
            TypeDoc::Name(name) => name,
            TypeDoc::Mapping { type_name, .. } => type_name,
        }
    }

    pub fn output_binding(&self) -> Option<&OutputBindingDoc> {
        match self {
            TypeDoc::Name(_) => None,
            TypeDoc::Mapping { output_binding, .. } => output_binding.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortDoc {
    pub id: String,
    #[serde(default)]
    pub depth: usize,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub links: Vec<LinkDoc>,
    #[serde(default, rename = "outputBinding")]
    pub output_binding: Option<OutputBindingDoc>,
    #[serde(default, rename = "type")]
    pub port_type: Option<TypeDoc>,
}

impl PortDoc {
    /// Port-level binding wins over a type-level one when both are declared.
    pub fn effective_output_binding(&self) -> Option<&OutputBindingDoc> {
        self.output_binding
            .as_ref()
            .or_else(|| self.port_type.as_ref().and_then(TypeDoc::output_binding))
    }

    pub fn declares_file_type(&self) -> bool {
        self.port_type
            .as_ref()
            .map(|t| t.type_name() == "File")
            .unwrap_or(false)
    }

    pub fn declares_file_array_type(&self) -> bool {
        self.port_type
            .as_ref()
            .map(|t| t.type_name() == "array")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDoc {
    pub id: String,
    #[serde(rename = "impl")]
    pub impl_path: String,
    #[serde(default)]
    pub inputs: Vec<PortDoc>,
    #[serde(default)]
    pub outputs: Vec<PortDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputBindingDoc {
    pub input: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDoc {
    #[serde(default, rename = "baseCmd")]
    pub base_cmd: Vec<Value>,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default, rename = "inputBindings")]
    pub input_bindings: Vec<InputBindingDoc>,
    #[serde(default)]
    pub inputs: Vec<PortDoc>,
    #[serde(default)]
    pub outputs: Vec<PortDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpressionBody {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpressionToolDoc {
    #[serde(default)]
    pub inputs: Vec<PortDoc>,
    #[serde(default)]
    pub outputs: Vec<PortDoc>,
    pub expression: ExpressionBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDoc {
    #[serde(default)]
    pub inputs: Vec<PortDoc>,
    #[serde(default)]
    pub outputs: Vec<PortDoc>,
    #[serde(default)]
    pub steps: Vec<StepDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassDoc {
    pub class: Option<String>,
}
