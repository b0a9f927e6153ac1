use serde_json::Value;

use flowmind_core::error::{FlowError, Result};

use super::NodeOutput;
use crate::graph::{Node, UpdateAction, UpdateConfig};
use crate::state::{interpolate_value, type_name, StateStore};

/// Compute the writes of an update_state node from a snapshot of state.
pub(crate) fn run(node: &Node, config: &UpdateConfig, state: &StateStore) -> Result<NodeOutput> {
    let Some(action) = config.action else {
        let fields = config
            .values
            .iter()
            .map(|(key, value)| Ok((key.clone(), interpolate_value(value, state)?)))
            .collect::<Result<Vec<_>>>()?;
        return Ok(NodeOutput::from_fields(fields));
    };

    let target = match node.output.as_slice() {
        [field] => field.name.as_str(),
        _ => {
            return Err(FlowError::Structural(format!(
                "node '{}': {action:?} requires exactly one output field",
                node.name
            )))
        }
    };

    let value = match action {
        UpdateAction::Append => {
            let item = operand(config, state)?.ok_or_else(|| missing_operand(node))?;
            match state.get(target) {
                None => Value::Array(vec![item]),
                Some(Value::Array(items)) => {
                    let mut items = items.clone();
                    items.push(item);
                    Value::Array(items)
                }
                Some(other) => return Err(mismatch(target, "list", other)),
            }
        }
        UpdateAction::Overwrite => operand(config, state)?.ok_or_else(|| missing_operand(node))?,
        UpdateAction::Increment => {
            let delta = operand(config, state)?.unwrap_or(Value::from(1));
            if !delta.is_number() {
                let key = config.source.as_deref().unwrap_or("value");
                return Err(mismatch(key, "number", &delta));
            }
            match state.get(target) {
                None => delta,
                Some(current) if current.is_number() => add(target, current, &delta)?,
                Some(other) => return Err(mismatch(target, "number", other)),
            }
        }
    };

    Ok(NodeOutput::from_fields(vec![(target.to_string(), value)]))
}

/// The copied `source` value, else the interpolated literal `value`.
fn operand(config: &UpdateConfig, state: &StateStore) -> Result<Option<Value>> {
    if let Some(source) = &config.source {
        return state
            .get(source)
            .cloned()
            .map(Some)
            .ok_or_else(|| FlowError::UnknownVariable(source.clone()));
    }
    config
        .value
        .as_ref()
        .map(|v| interpolate_value(v, state))
        .transpose()
}

fn add(key: &str, current: &Value, delta: &Value) -> Result<Value> {
    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| FlowError::TypeMismatch {
                key: key.to_string(),
                expected: "int within range".into(),
                found: "overflow".into(),
            });
    }
    let sum = current.as_f64().unwrap_or_default() + delta.as_f64().unwrap_or_default();
    serde_json::Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| mismatch(key, "finite number", current))
}

fn mismatch(key: &str, expected: &str, found: &Value) -> FlowError {
    FlowError::TypeMismatch {
        key: key.to_string(),
        expected: expected.to_string(),
        found: type_name(found).to_string(),
    }
}

fn missing_operand(node: &Node) -> FlowError {
    FlowError::Structural(format!("node '{}' needs a `source` or a `value`", node.name))
}
