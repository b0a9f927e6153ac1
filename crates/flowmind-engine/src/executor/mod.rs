//! Node executors.
//!
//! Every executor reads state and returns its writes as a [`NodeOutput`]
//! delta; the runner applies the delta in one step once the node succeeds.

pub(crate) mod input;
pub(crate) mod llm;
pub(crate) mod output;
pub(crate) mod tool;
pub(crate) mod update;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flowmind_core::approval::ApprovalRequest;
use flowmind_core::config::EngineConfig;
use flowmind_core::error::{FlowError, Result};
use flowmind_core::traits::ModelClient;
use flowmind_core::types::{RunId, ToolCallRecord, ToolContext};
use flowmind_core::EventBus;
use flowmind_tools::ToolRegistry;

use crate::fanout::FanoutSummary;
use crate::graph::{Node, OutputField};
use crate::tool_loop::LoopCheckpoint;

/// Writes and side output produced by one node execution.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    /// State writes, in declaration order.
    pub fields: Vec<(String, Value)>,
    /// Lines emitted by output nodes.
    pub lines: Vec<String>,
    /// Tool calls made while producing the output.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Set for fan-out nodes.
    pub fanout: Option<FanoutSummary>,
}

impl NodeOutput {
    pub fn from_fields(fields: Vec<(String, Value)>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

/// Result of starting or resuming a node.
#[derive(Debug)]
pub(crate) enum Step {
    Complete(NodeOutput),
    Suspend(Pending),
}

/// What a suspended node is waiting for.
#[derive(Debug)]
pub(crate) enum Pending {
    Input {
        prompt: String,
        options: Option<Vec<Value>>,
    },
    Approval {
        request: ApprovalRequest,
        checkpoint: Box<LoopCheckpoint>,
    },
}

/// Borrowed capabilities shared by all executors during one run.
#[derive(Clone, Copy)]
pub(crate) struct ExecEnv<'a> {
    pub model: &'a dyn ModelClient,
    pub tools: &'a ToolRegistry,
    pub config: &'a EngineConfig,
    pub events: &'a EventBus,
    pub run_id: &'a RunId,
    pub cancel: &'a CancellationToken,
}

impl ExecEnv<'_> {
    pub fn tool_context(&self, node: &str, item_index: Option<usize>) -> ToolContext {
        ToolContext {
            run_id: self.run_id.clone(),
            node: node.to_string(),
            item_index,
        }
    }
}

/// Coerce a value into a declared field.
pub(crate) fn coerce_field(field: &OutputField, value: &Value) -> Result<Value> {
    field
        .coerce(value)
        .map_err(|(expected, found)| FlowError::TypeMismatch {
            key: field.name.clone(),
            expected,
            found,
        })
}

/// Distribute one value over a node's declared output fields.
///
/// A single field receives the whole value; several fields require a map
/// holding each of them.
pub(crate) fn fields_from_value(node: &Node, value: &Value) -> Result<Vec<(String, Value)>> {
    match node.output.as_slice() {
        [] => Ok(vec![]),
        [field] => Ok(vec![(field.name.clone(), coerce_field(field, value)?)]),
        fields => {
            let map = value.as_object().ok_or_else(|| FlowError::TypeMismatch {
                key: node.name.clone(),
                expected: "map".into(),
                found: crate::state::type_name(value).into(),
            })?;
            fields
                .iter()
                .map(|field| {
                    let raw = map.get(&field.name).ok_or_else(|| FlowError::TypeMismatch {
                        key: field.name.clone(),
                        expected: field.field_type.as_str().into(),
                        found: "nothing".into(),
                    })?;
                    Ok((field.name.clone(), coerce_field(field, raw)?))
                })
                .collect()
        }
    }
}
