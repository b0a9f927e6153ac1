use serde_json::Value;
use tracing::debug;

use flowmind_core::error::{FlowError, Result};

use super::{fields_from_value, NodeOutput, Pending, Step};
use crate::expr::values_equal;
use crate::graph::{InputConfig, InputOptions, Node};
use crate::state::{interpolate, interpolate_value, type_name, VarLookup};

/// Render the prompt and either consume a pre-supplied value or suspend.
pub(crate) fn prepare(
    node: &Node,
    config: &InputConfig,
    vars: &dyn VarLookup,
    supplied: Option<Value>,
) -> Result<Step> {
    let prompt = interpolate(&config.prompt, vars)?;
    let options = resolve_options(config, vars)?;

    match supplied {
        Some(value) => {
            debug!(node = %node.name, "Using pre-supplied input");
            accept(node, value, options.as_deref()).map(Step::Complete)
        }
        None => Ok(Step::Suspend(Pending::Input { prompt, options })),
    }
}

/// Validate a caller-provided value and turn it into the node's writes.
pub(crate) fn accept(node: &Node, value: Value, options: Option<&[Value]>) -> Result<NodeOutput> {
    if let Some(options) = options {
        if !options.iter().any(|o| values_equal(o, &value)) {
            return Err(FlowError::InvalidResume(format!(
                "{value} is not one of the allowed options for '{}'",
                node.name
            )));
        }
    }
    let fields = fields_from_value(node, &value)
        .map_err(|e| FlowError::InvalidResume(format!("input for '{}': {e}", node.name)))?;
    Ok(NodeOutput::from_fields(fields))
}

fn resolve_options(config: &InputConfig, vars: &dyn VarLookup) -> Result<Option<Vec<Value>>> {
    match &config.options {
        None => Ok(None),
        Some(InputOptions::List(items)) => items
            .iter()
            .map(|item| interpolate_value(item, vars))
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(InputOptions::Reference(reference)) => {
            match interpolate_value(&Value::String(reference.clone()), vars)? {
                Value::Array(items) => Ok(Some(items)),
                other => Err(FlowError::TypeMismatch {
                    key: reference.clone(),
                    expected: "list".into(),
                    found: type_name(&other).into(),
                }),
            }
        }
    }
}
