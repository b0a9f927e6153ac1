//! The tool-call loop behind LLM nodes.
//!
//! One loop iteration handles the pending tool calls of the previous model
//! turn (approval gate, invocation, raw-output capture), feeds the
//! observations back, and asks the model again. The loop ends on a response
//! without tool calls, which is then parsed into the node's output fields.
//! Everything needed to continue lives in [`LoopCheckpoint`], so a call that
//! needs caller approval suspends the loop and resumes it in the same turn.

use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use flowmind_core::approval::{ApprovalDecision, ApprovalRequest, GateDecision};
use flowmind_core::error::{FlowError, Result};
use flowmind_core::types::{
    ChatMessage, ContentBlock, FlowEvent, ModelRequest, Role, StreamDelta, ToolCallRecord,
    ToolDefinition, ToolResult,
};

use crate::executor::{ExecEnv, NodeOutput, Pending, Step};
use crate::graph::{LlmConfig, Node};
use crate::output_parser::{parse_fields, truncate_for_model};
use crate::retry::backoff_delay;

#[derive(Debug, Clone)]
pub(crate) struct PendingCall {
    id: String,
    name: String,
    input: Value,
}

/// Resumable state of one LLM node turn.
#[derive(Debug)]
pub(crate) struct LoopCheckpoint {
    system: Option<String>,
    messages: Vec<ChatMessage>,
    tool_defs: Vec<ToolDefinition>,
    schema: Option<Value>,
    /// Calls from the last model turn not yet handled.
    pending: VecDeque<PendingCall>,
    /// Tool results gathered for the last model turn.
    observations: Vec<ContentBlock>,
    /// Fields filled straight from raw tool output.
    captured: BTreeMap<String, Value>,
    /// Model turns that requested tools.
    steps: usize,
    parse_attempts: u32,
    records: Vec<ToolCallRecord>,
    awaiting: Option<PendingCall>,
    item_index: Option<usize>,
}

impl LoopCheckpoint {
    pub(crate) fn new(
        system: Option<String>,
        prompt: String,
        tool_defs: Vec<ToolDefinition>,
        schema: Option<Value>,
        item_index: Option<usize>,
    ) -> Self {
        Self {
            system,
            messages: vec![ChatMessage::user(prompt)],
            tool_defs,
            schema,
            pending: VecDeque::new(),
            observations: Vec::new(),
            captured: BTreeMap::new(),
            steps: 0,
            parse_attempts: 0,
            records: Vec::new(),
            awaiting: None,
            item_index,
        }
    }
}

/// Accumulates a streamed tool call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// One model response.
struct ModelTurn {
    text: String,
    calls: Vec<PendingCall>,
}

enum Gate {
    Run,
    Ask,
    Reject(String),
}

/// Run the loop until the node finishes or a call needs approval.
pub(crate) async fn drive(
    env: ExecEnv<'_>,
    node: &Node,
    config: &LlmConfig,
    mut cp: LoopCheckpoint,
) -> Result<Step> {
    let max_steps = config.max_steps.unwrap_or(env.config.engine.max_tool_steps);

    loop {
        if env.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        while let Some(call) = cp.pending.pop_front() {
            match gate(env, config, &call) {
                Gate::Run => run_call(env, node, config, &mut cp, call).await?,
                Gate::Reject(reason) => reject(node, &mut cp, call, reason),
                Gate::Ask => {
                    let request = ApprovalRequest::new(&node.name, &call.name, call.input.clone());
                    info!(node = %node.name, tool = %call.name, request_id = %request.id, "Tool call needs approval");
                    cp.awaiting = Some(call);
                    return Ok(Step::Suspend(Pending::Approval {
                        request,
                        checkpoint: Box::new(cp),
                    }));
                }
            }
        }

        if !cp.observations.is_empty() {
            let content = std::mem::take(&mut cp.observations);
            cp.messages.push(ChatMessage {
                role: Role::User,
                content,
            });
            if all_fields_captured(node, config, &cp) {
                debug!(node = %node.name, "All output fields captured from tool output");
                let fields = parse_fields(&node.output, "", &cp.captured).unwrap_or_default();
                return Ok(Step::Complete(NodeOutput {
                    fields,
                    tool_calls: cp.records,
                    ..NodeOutput::default()
                }));
            }
        }

        let turn = generate_with_retry(env, node, &cp).await?;
        cp.messages.push(assistant_message(&turn));

        if !turn.calls.is_empty() {
            if cp.steps >= max_steps {
                return Err(FlowError::ToolLoopExceeded {
                    node: node.name.clone(),
                    max_steps,
                });
            }
            cp.steps += 1;
            debug!(node = %node.name, step = cp.steps, calls = turn.calls.len(), "Model requested tools");
            cp.pending.extend(turn.calls);
            continue;
        }

        match parse_fields(&node.output, &turn.text, &cp.captured) {
            Ok(fields) => {
                return Ok(Step::Complete(NodeOutput {
                    fields,
                    tool_calls: cp.records,
                    ..NodeOutput::default()
                }))
            }
            Err(message) => {
                let max_retries = env.config.retry.max_retries;
                if cp.parse_attempts >= max_retries {
                    return Err(FlowError::StructuredOutputParse {
                        node: node.name.clone(),
                        message,
                    });
                }
                cp.parse_attempts += 1;
                warn!(
                    node = %node.name,
                    attempt = cp.parse_attempts,
                    max_retries,
                    error = %message,
                    "Re-prompting after unparseable answer"
                );
                env.events.publish(FlowEvent::RetryNotice {
                    node: node.name.clone(),
                    attempt: cp.parse_attempts,
                    max_retries,
                    reason: message.clone(),
                });
                cp.messages.push(ChatMessage::user(reprompt(&message, cp.schema.as_ref())));
            }
        }
    }
}

/// Apply the caller's decision to the call awaiting approval, then continue.
pub(crate) async fn resume(
    env: ExecEnv<'_>,
    node: &Node,
    config: &LlmConfig,
    mut cp: LoopCheckpoint,
    decision: ApprovalDecision,
) -> Result<Step> {
    let call = cp
        .awaiting
        .take()
        .ok_or_else(|| FlowError::InvalidResume("no tool call is awaiting approval".into()))?;

    match decision {
        ApprovalDecision::Approved => run_call(env, node, config, &mut cp, call).await?,
        ApprovalDecision::Denied { reason } => {
            let denial = FlowError::ToolApprovalDenied {
                tool: call.name.clone(),
                reason,
            };
            reject(node, &mut cp, call, denial.to_string());
        }
    }
    drive(env, node, config, cp).await
}

fn gate(env: ExecEnv<'_>, config: &LlmConfig, call: &PendingCall) -> Gate {
    if !config.tools.iter().any(|t| *t == call.name) {
        return Gate::Reject(format!("Tool '{}' is not available to this node", call.name));
    }
    match env.config.approval.decide(&call.name, config.require_approval) {
        GateDecision::Allow => Gate::Run,
        GateDecision::NeedsApproval => Gate::Ask,
        GateDecision::Deny => Gate::Reject(
            FlowError::ToolApprovalDenied {
                tool: call.name.clone(),
                reason: "blocked by policy".into(),
            }
            .to_string(),
        ),
    }
}

/// Feed a refusal back to the model as a failed tool result.
fn reject(node: &Node, cp: &mut LoopCheckpoint, call: PendingCall, reason: String) {
    info!(node = %node.name, tool = %call.name, reason = %reason, "Tool call refused");
    let result = ToolResult::error(reason.clone());
    cp.observations.push(ContentBlock::ToolResult {
        tool_use_id: call.id,
        content: reason.clone(),
        is_error: true,
    });
    cp.records.push(ToolCallRecord {
        tool: call.name,
        args: call.input,
        result: Some(result),
        decision: ApprovalDecision::Denied { reason },
        timestamp: Utc::now(),
    });
}

async fn run_call(
    env: ExecEnv<'_>,
    node: &Node,
    config: &LlmConfig,
    cp: &mut LoopCheckpoint,
    call: PendingCall,
) -> Result<()> {
    env.events.publish(FlowEvent::ToolStart {
        node: node.name.clone(),
        name: call.name.clone(),
        input: call.input.clone(),
    });

    let ctx = env.tool_context(&node.name, cp.item_index);
    let result = tokio::select! {
        result = env.tools.invoke(&call.name, call.input.clone(), ctx) => result,
        _ = env.cancel.cancelled() => return Err(FlowError::Cancelled),
    };
    let result = result.unwrap_or_else(|e| {
        warn!(node = %node.name, tool = %call.name, error = %e, "Tool execution failed");
        ToolResult::error(e.to_string())
    });

    env.events.publish(FlowEvent::ToolEnd {
        node: node.name.clone(),
        name: call.name.clone(),
        result: result.clone(),
    });

    let mut fed_back = truncate_for_model(&result.content, env.config.engine.max_tool_output_chars);
    if !result.is_error {
        for (field, tool) in &config.raw_tool_output {
            if *tool != call.name {
                continue;
            }
            let raw = Value::String(result.content.clone());
            let value = node
                .field(field)
                .and_then(|f| f.field_type.coerce(&raw))
                .unwrap_or(raw);
            cp.captured.insert(field.clone(), value);
            fed_back = format!("[output of '{}' stored in '{field}']", call.name);
        }
    }

    cp.observations.push(ContentBlock::ToolResult {
        tool_use_id: call.id,
        content: fed_back,
        is_error: result.is_error,
    });
    cp.records.push(ToolCallRecord {
        tool: call.name,
        args: call.input,
        result: Some(result),
        decision: ApprovalDecision::Approved,
        timestamp: Utc::now(),
    });
    Ok(())
}

fn all_fields_captured(node: &Node, config: &LlmConfig, cp: &LoopCheckpoint) -> bool {
    !config.raw_tool_output.is_empty()
        && !node.output.is_empty()
        && node.output.iter().all(|f| cp.captured.contains_key(&f.name))
}

async fn generate_with_retry(env: ExecEnv<'_>, node: &Node, cp: &LoopCheckpoint) -> Result<ModelTurn> {
    let retry = &env.config.retry;
    let mut attempt = 0u32;
    loop {
        let request = ModelRequest {
            model: env.config.model.clone(),
            system: cp.system.clone(),
            messages: cp.messages.clone(),
            tools: cp.tool_defs.clone(),
            output_schema: cp.schema.clone(),
        };
        match stream_turn(env, node, request).await {
            Ok(turn) => return Ok(turn),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = backoff_delay(attempt, retry);
                attempt += 1;
                warn!(
                    node = %node.name,
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying model request"
                );
                env.events.publish(FlowEvent::RetryNotice {
                    node: node.name.clone(),
                    attempt,
                    max_retries: retry.max_retries,
                    reason: e.to_string(),
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = env.cancel.cancelled() => return Err(FlowError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Call the model once and accumulate its streamed response.
async fn stream_turn(env: ExecEnv<'_>, node: &Node, request: ModelRequest) -> Result<ModelTurn> {
    let mut stream = tokio::select! {
        result = env.model.generate(request) => result?,
        _ = env.cancel.cancelled() => return Err(FlowError::Cancelled),
    };

    let mut text = String::new();
    let mut calls: Vec<ToolCallAccumulator> = Vec::new();

    loop {
        let delta = tokio::select! {
            delta = stream.next() => delta,
            _ = env.cancel.cancelled() => return Err(FlowError::Cancelled),
        };
        let Some(delta) = delta else { break };

        match delta? {
            StreamDelta::TextDelta(chunk) => {
                env.events.publish(FlowEvent::TextDelta {
                    node: node.name.clone(),
                    text: chunk.clone(),
                });
                text.push_str(&chunk);
            }
            StreamDelta::ToolUseStart { index, id, name } => {
                while calls.len() <= index {
                    calls.push(ToolCallAccumulator::default());
                }
                calls[index].id = id;
                calls[index].name = name;
            }
            StreamDelta::ToolInputDelta { index, delta } => {
                if let Some(tc) = calls.get_mut(index) {
                    tc.input_json.push_str(&delta);
                }
            }
            StreamDelta::Stop(reason) => {
                debug!(node = %node.name, ?reason, "Model turn stopped");
            }
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                debug!(node = %node.name, input_tokens, output_tokens, "Model usage");
            }
        }
    }

    let calls = calls
        .into_iter()
        .enumerate()
        .filter(|(_, tc)| !tc.name.is_empty())
        .map(|(i, tc)| PendingCall {
            id: if tc.id.is_empty() { format!("call_{i}") } else { tc.id },
            name: tc.name,
            input: parse_tool_input(&tc.input_json),
        })
        .collect();

    Ok(ModelTurn { text, calls })
}

fn parse_tool_input(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

fn assistant_message(turn: &ModelTurn) -> ChatMessage {
    let mut content = Vec::new();
    if !turn.text.is_empty() {
        content.push(ContentBlock::Text {
            text: turn.text.clone(),
        });
    }
    for call in &turn.calls {
        content.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }
    ChatMessage {
        role: Role::Assistant,
        content,
    }
}

fn reprompt(error: &str, schema: Option<&Value>) -> String {
    match schema {
        Some(schema) => format!(
            "Your previous answer could not be used: {error}.\n\
             Reply again with only a JSON object matching this schema:\n{schema}"
        ),
        None => format!("Your previous answer could not be used: {error}. Please answer again."),
    }
}
