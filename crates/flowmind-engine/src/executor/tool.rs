use chrono::Utc;
use serde_json::Value;
use tracing::{error, info};

use flowmind_core::approval::ApprovalDecision;
use flowmind_core::error::{FlowError, Result};
use flowmind_core::types::{FlowEvent, ToolCallRecord, ToolResult};

use super::{fields_from_value, ExecEnv, NodeOutput};
use crate::graph::{FieldType, Node, ToolConfig};
use crate::state::{interpolate_value, VarLookup};

/// Invoke the node's tool with interpolated arguments. Tool nodes are not
/// approval-gated: their place in the graph authorizes them.
pub(crate) async fn run(
    env: ExecEnv<'_>,
    node: &Node,
    config: &ToolConfig,
    vars: &dyn VarLookup,
    item_index: Option<usize>,
) -> Result<NodeOutput> {
    let args = interpolate_value(&Value::Object(config.args.clone()), vars)?;

    env.events.publish(FlowEvent::ToolStart {
        node: node.name.clone(),
        name: config.tool.clone(),
        input: args.clone(),
    });
    info!(node = %node.name, tool = %config.tool, "Running tool node");

    let ctx = env.tool_context(&node.name, item_index);
    let result = tokio::select! {
        result = env.tools.invoke(&config.tool, args.clone(), ctx) => result,
        _ = env.cancel.cancelled() => return Err(FlowError::Cancelled),
    };

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            error!(node = %node.name, tool = %config.tool, error = %e, "Tool node failed");
            ToolResult::error(e.to_string())
        }
    };

    env.events.publish(FlowEvent::ToolEnd {
        node: node.name.clone(),
        name: config.tool.clone(),
        result: result.clone(),
    });

    if result.is_error {
        return Err(FlowError::ToolInvocation {
            tool: config.tool.clone(),
            message: result.content,
        });
    }

    let declared = env.tools.get(&config.tool).and_then(|t| t.output_schema());
    let value = result_value(node, &config.tool, declared.as_ref(), &result.content)?;
    let fields = fields_from_value(node, &value)?;
    Ok(NodeOutput {
        fields,
        tool_calls: vec![ToolCallRecord {
            tool: config.tool.clone(),
            args,
            result: Some(result),
            decision: ApprovalDecision::Approved,
            timestamp: Utc::now(),
        }],
        ..NodeOutput::default()
    })
}

/// Tool results are text. A lone string field keeps the text; otherwise a
/// declared output schema decides how it decodes, falling back to JSON when
/// it parses and plain text when it does not.
fn result_value(
    node: &Node,
    tool: &str,
    declared: Option<&Value>,
    content: &str,
) -> Result<Value> {
    if let [field] = node.output.as_slice() {
        if field.field_type == FieldType::String {
            return Ok(Value::String(content.to_string()));
        }
    }
    match declared.and_then(|schema| schema.get("type")).and_then(Value::as_str) {
        Some("string") => Ok(Value::String(content.to_string())),
        Some(kind) => {
            let value: Value =
                serde_json::from_str(content).map_err(|e| FlowError::ToolInvocation {
                    tool: tool.to_string(),
                    message: format!("result is not the declared {kind}: {e}"),
                })?;
            check_required(tool, declared, &value)?;
            Ok(value)
        }
        None => Ok(serde_json::from_str(content)
            .unwrap_or_else(|_| Value::String(content.to_string()))),
    }
}

fn check_required(tool: &str, declared: Option<&Value>, value: &Value) -> Result<()> {
    let required = declared
        .and_then(|schema| schema.get("required"))
        .and_then(Value::as_array);
    let Some(required) = required else {
        return Ok(());
    };
    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| value.get(*key).is_none())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(FlowError::ToolInvocation {
        tool: tool.to_string(),
        message: format!("result is missing declared fields: {}", missing.join(", ")),
    })
}
