use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::config::ModelConfig;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool use blocks from this message.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Stop reason from the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the model.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// One call to the model capability.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: Option<ModelConfig>,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Tool declarations the model may call (empty = no tools).
    pub tools: Vec<ToolDefinition>,
    /// JSON schema the final answer should follow.
    pub output_schema: Option<serde_json::Value>,
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition for sending to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub node: String,
    /// Fan-out item index when invoked from a worker.
    pub item_index: Option<usize>,
}

/// One tool call made inside an LLM node turn.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: serde_json::Value,
    pub result: Option<ToolResult>,
    pub decision: ApprovalDecision,
    pub timestamp: DateTime<Utc>,
}

/// Why a run is waiting on its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    AwaitingInput,
    AwaitingApproval,
}

impl std::fmt::Display for WaitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingInput => write!(f, "awaiting_input"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
        }
    }
}

/// Event broadcast to all subscribers while a flow runs.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Flow run started.
    RunStarted { run_id: RunId },
    /// A node began executing.
    NodeStarted { node: String },
    /// A node finished and its outputs were applied.
    NodeCompleted { node: String, elapsed_ms: u64 },
    /// A declared output field flagged as a user message.
    UserMessage {
        node: String,
        field: String,
        value: serde_json::Value,
    },
    /// A line emitted by an Output node.
    Output { node: String, text: String },
    /// Text streaming from the model.
    TextDelta { node: String, text: String },
    /// Tool execution started.
    ToolStart {
        node: String,
        name: String,
        input: serde_json::Value,
    },
    /// Tool execution completed.
    ToolEnd {
        node: String,
        name: String,
        result: ToolResult,
    },
    /// A retryable error occurred; another attempt follows.
    RetryNotice {
        node: String,
        attempt: u32,
        max_retries: u32,
        reason: String,
    },
    /// Fan-out progress counters.
    FanoutProgress {
        node: String,
        started: usize,
        completed: usize,
        active: usize,
        total: usize,
    },
    /// An Input node is waiting for a value.
    InputRequested {
        node: String,
        prompt: String,
        options: Option<Vec<serde_json::Value>>,
    },
    /// Approval requested for a tool call.
    ApprovalRequested { request: ApprovalRequest },
    /// Approval resolved (approved or denied).
    ApprovalResolved { request_id: String, approved: bool },
    /// Flow run reached END.
    RunCompleted { run_id: RunId, steps: usize },
    /// Flow run failed.
    RunFailed { run_id: RunId, error: String },
}
