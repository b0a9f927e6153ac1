use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::{render, type_name};

/// A step in a flow.
///
/// The kind-specific configuration is flattened into the node, so a node
/// definition reads as `{"name": "ask", "type": "input", "prompt": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique name within the flow.
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Declared output fields, written to run state when the node completes.
    #[serde(default)]
    pub output: Vec<OutputField>,
    /// Maximum number of executions within one run.
    #[serde(default)]
    pub limit: Option<u64>,
    /// State key holding this node's execution counter.
    #[serde(default)]
    pub limit_counter_field: Option<String>,
    /// Run this node once per element of a list.
    #[serde(default)]
    pub foreach: Option<ForEach>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Input(InputConfig),
    Llm(LlmConfig),
    Tool(ToolConfig),
    Output(OutputConfig),
    UpdateState(UpdateConfig),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Llm(_) => "llm",
            Self::Tool(_) => "tool",
            Self::Output(_) => "output",
            Self::UpdateState(_) => "update_state",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub prompt: String,
    #[serde(default)]
    pub options: Option<InputOptions>,
}

/// Allowed answers for an input node: a literal list or a `{ref}` to a list in state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputOptions {
    List(Vec<Value>),
    Reference(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
    /// Tool whitelist offered to the model.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub require_approval: bool,
    /// Output field -> tool whose raw result fills that field.
    #[serde(default)]
    pub raw_tool_output: BTreeMap<String, String>,
    /// Cap on model turns in the tool-call loop (engine default when unset).
    #[serde(default)]
    pub max_steps: Option<usize>,
}

impl LlmConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            tools: vec![],
            require_approval: false,
            raw_tool_output: BTreeMap::new(),
            max_steps: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn with_raw_tool_output(mut self, field: impl Into<String>, tool: impl Into<String>) -> Self {
        self.raw_tool_output.insert(field.into(), tool.into());
        self
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = Some(steps);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tool: String,
    /// Arguments; string values are interpolated against run state.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolConfig {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Literal strings and/or `{ref}` lookups, emitted in order.
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Append,
    Overwrite,
    Increment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Single-target mode; bulk assignment of `values` when unset.
    #[serde(default)]
    pub action: Option<UpdateAction>,
    /// Bulk key -> value assignments (values are interpolated).
    #[serde(default)]
    pub values: Map<String, Value>,
    /// State key to read the value (or increment delta) from.
    #[serde(default)]
    pub source: Option<String>,
    /// Literal value (or increment delta).
    #[serde(default)]
    pub value: Option<Value>,
}

impl UpdateConfig {
    pub fn assign(values: Map<String, Value>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    pub fn action(action: UpdateAction) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Fan-out block: run the node once per element of `items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEach {
    /// State key of the list to iterate (`{key}` is accepted too).
    pub items: String,
    /// Name under which each worker sees its element.
    #[serde(rename = "as", default = "default_item_name")]
    pub item_name: String,
    /// State key receiving the aggregated per-item results.
    pub output: String,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

fn default_item_name() -> String {
    "item".to_string()
}

impl ForEach {
    pub fn new(items: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            items: items.into(),
            item_name: default_item_name(),
            output: output.into(),
            max_workers: None,
        }
    }

    pub fn with_item_name(mut self, name: impl Into<String>) -> Self {
        self.item_name = name.into();
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    /// The state key to iterate, with optional surrounding braces removed.
    pub fn items_key(&self) -> &str {
        let key = self.items.trim();
        key.strip_prefix('{')
            .and_then(|k| k.strip_suffix('}'))
            .unwrap_or(key)
    }

    /// Name of the per-worker index variable.
    pub fn index_name(&self) -> String {
        format!("{}_index", self.item_name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Int,
    Float,
    Bool,
    List,
    Map,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
        }
    }

    /// JSON schema type keyword.
    pub fn schema_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "integer",
            Self::Float => "number",
            Self::Bool => "boolean",
            Self::List => "array",
            Self::Map => "object",
        }
    }

    /// Convert a value to this type. Strings holding numbers, booleans or
    /// JSON are parsed; anything converts to a string.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::String, Value::String(_)) => Some(value.clone()),
            (Self::String, Value::Null) => None,
            (Self::String, other) => Some(Value::String(render(other))),

            (Self::Int, Value::Number(n)) => n
                .as_i64()
                .map(Value::from)
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(f))
                        .map(|f| Value::from(f as i64))
                }),
            (Self::Int, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),

            (Self::Float, Value::Number(n)) => n.as_f64().map(Value::from),
            (Self::Float, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),

            (Self::Bool, Value::Bool(_)) => Some(value.clone()),
            (Self::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(Value::Bool(true)),
                "false" | "no" => Some(Value::Bool(false)),
                _ => None,
            },

            (Self::List, Value::Array(_)) => Some(value.clone()),
            (Self::Map, Value::Object(_)) => Some(value.clone()),
            (Self::List | Self::Map, Value::String(s)) => {
                let parsed: Value = serde_json::from_str(s.trim()).ok()?;
                match (self, &parsed) {
                    (Self::List, Value::Array(_)) | (Self::Map, Value::Object(_)) => Some(parsed),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// A declared output field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub description: Option<String>,
    /// Stream the value to the caller as a user message when written.
    #[serde(default)]
    pub user_message: bool,
}

impl OutputField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::String,
            description: None,
            user_message: false,
        }
    }

    pub fn typed(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn user_message(mut self) -> Self {
        self.user_message = true;
        self
    }

    /// Coerce a value to this field's type, describing the mismatch on failure.
    pub fn coerce(&self, value: &Value) -> Result<Value, (String, String)> {
        self.field_type.coerce(value).ok_or_else(|| {
            (
                self.field_type.as_str().to_string(),
                type_name(value).to_string(),
            )
        })
    }
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            output: vec![],
            limit: None,
            limit_counter_field: None,
            foreach: None,
        }
    }

    pub fn input(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            name,
            NodeKind::Input(InputConfig {
                prompt: prompt.into(),
                options: None,
            }),
        )
    }

    pub fn llm(name: impl Into<String>, config: LlmConfig) -> Self {
        Self::new(name, NodeKind::Llm(config))
    }

    pub fn tool(name: impl Into<String>, config: ToolConfig) -> Self {
        Self::new(name, NodeKind::Tool(config))
    }

    pub fn output(name: impl Into<String>, values: &[&str]) -> Self {
        Self::new(
            name,
            NodeKind::Output(OutputConfig {
                values: values.iter().map(|v| v.to_string()).collect(),
            }),
        )
    }

    pub fn update(name: impl Into<String>, config: UpdateConfig) -> Self {
        Self::new(name, NodeKind::UpdateState(config))
    }

    /// Declare an output field.
    pub fn with_output(mut self, field: OutputField) -> Self {
        self.output.push(field);
        self
    }

    /// Set the input options (input nodes only; ignored otherwise).
    pub fn with_options(mut self, options: InputOptions) -> Self {
        if let NodeKind::Input(ref mut config) = self.kind {
            config.options = Some(options);
        }
        self
    }

    /// Bound the number of executions, counting in `counter_field`.
    pub fn with_limit(mut self, limit: u64, counter_field: impl Into<String>) -> Self {
        self.limit = Some(limit);
        self.limit_counter_field = Some(counter_field.into());
        self
    }

    pub fn with_foreach(mut self, foreach: ForEach) -> Self {
        self.foreach = Some(foreach);
        self
    }

    pub fn field(&self, name: &str) -> Option<&OutputField> {
        self.output.iter().find(|f| f.name == name)
    }

    /// Whether model tool calls from this node need caller approval.
    pub fn requires_approval(&self) -> bool {
        matches!(&self.kind, NodeKind::Llm(config) if config.require_approval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_builder() {
        let node = Node::llm(
            "summarize",
            LlmConfig::new("Summarize {text}")
                .with_system("You are terse.")
                .with_tools(&["search"])
                .with_max_steps(3),
        )
        .with_output(OutputField::new("summary").described("One paragraph"))
        .with_limit(2, "summarize_runs");

        assert_eq!(node.name, "summarize");
        assert_eq!(node.kind.label(), "llm");
        assert_eq!(node.limit, Some(2));
        assert_eq!(node.limit_counter_field.as_deref(), Some("summarize_runs"));
        assert_eq!(node.field("summary").unwrap().description.as_deref(), Some("One paragraph"));
    }

    #[test]
    fn test_deserialize_flattened_kind() {
        let node: Node = serde_json::from_value(json!({
            "name": "ask",
            "type": "input",
            "prompt": "Pick one",
            "options": ["a", "b"],
            "output": [{"name": "choice"}]
        }))
        .unwrap();

        match &node.kind {
            NodeKind::Input(config) => {
                assert_eq!(config.prompt, "Pick one");
                assert!(matches!(config.options, Some(InputOptions::List(ref l)) if l.len() == 2));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(node.output[0].field_type, FieldType::String);
    }

    #[test]
    fn test_deserialize_update_and_foreach() {
        let node: Node = serde_json::from_value(json!({
            "name": "bump",
            "type": "update_state",
            "action": "increment",
            "value": 2,
            "output": [{"name": "count", "type": "int"}]
        }))
        .unwrap();
        match &node.kind {
            NodeKind::UpdateState(config) => {
                assert_eq!(config.action, Some(UpdateAction::Increment));
                assert_eq!(config.value, Some(json!(2)));
            }
            other => panic!("unexpected kind: {other:?}"),
        }

        let node: Node = serde_json::from_value(json!({
            "name": "fetch",
            "type": "tool",
            "tool": "http_get",
            "args": {"url": "{item}"},
            "foreach": {"items": "{urls}", "as": "url", "output": "pages", "max_workers": 2}
        }))
        .unwrap();
        let foreach = node.foreach.unwrap();
        assert_eq!(foreach.items_key(), "urls");
        assert_eq!(foreach.item_name, "url");
        assert_eq!(foreach.index_name(), "url_index");
        assert_eq!(foreach.max_workers, Some(2));
    }

    #[test]
    fn test_option_reference() {
        let node: Node = serde_json::from_value(json!({
            "name": "ask", "type": "input", "prompt": "?", "options": "{choices}"
        }))
        .unwrap();
        match node.kind {
            NodeKind::Input(config) => {
                assert!(matches!(config.options, Some(InputOptions::Reference(ref r)) if r == "{choices}"))
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_field_coercion() {
        assert_eq!(FieldType::Int.coerce(&json!("42")), Some(json!(42)));
        assert_eq!(FieldType::Int.coerce(&json!(3.0)), Some(json!(3)));
        assert_eq!(FieldType::Int.coerce(&json!(3.5)), None);
        assert_eq!(FieldType::Int.coerce(&json!(1e300)), None);
        assert_eq!(FieldType::Int.coerce(&json!(-1e19)), None);
        assert_eq!(FieldType::Float.coerce(&json!("2.5")), Some(json!(2.5)));
        assert_eq!(FieldType::Bool.coerce(&json!("TRUE")), Some(json!(true)));
        assert_eq!(FieldType::List.coerce(&json!("[1, 2]")), Some(json!([1, 2])));
        assert_eq!(FieldType::List.coerce(&json!("{\"a\": 1}")), None);
        assert_eq!(FieldType::Map.coerce(&json!({"a": 1})), Some(json!({"a": 1})));
        assert_eq!(FieldType::String.coerce(&json!(7)), Some(json!("7")));
        assert_eq!(FieldType::String.coerce(&Value::Null), None);
    }

    #[test]
    fn test_output_field_mismatch_reports_types() {
        let field = OutputField::new("n").typed(FieldType::Int);
        assert_eq!(
            field.coerce(&json!(["x"])),
            Err(("int".to_string(), "list".to_string()))
        );
    }
}
