//! flowmind: run declarative LLM workflows.
//!
//! This crate re-exports the public API of the workspace crates:
//! [`flowmind_core`] for shared types, capability traits and configuration,
//! [`flowmind_tools`] for the tool registry, and [`flowmind_engine`] for
//! flow definitions and the runner.

pub use flowmind_core::approval::{ApprovalDecision, ApprovalPolicy, ApprovalRequest};
pub use flowmind_core::config::{EngineConfig, ModelConfig, RetryConfig, RunLimits};
pub use flowmind_core::error::{FlowError, Result};
pub use flowmind_core::traits::{ModelClient, Tool};
pub use flowmind_core::types::{
    ChatMessage, ContentBlock, FlowEvent, ModelRequest, Role, RunId, StopReason, StreamDelta,
    ToolCallRecord, ToolContext, ToolDefinition, ToolResult, WaitReason,
};
pub use flowmind_core::EventBus;
pub use flowmind_engine::{
    Edge, FanoutSummary, FieldType, Flow, FlowDefinition, FlowRunner, ForEach, InputOptions,
    LlmConfig, Node, NodeKind, OutputField, Resume, Run, RunFailure, RunOutcome, RunStatus,
    StateStore, Suspension, ToolConfig, UpdateAction, UpdateConfig, END, START,
};
pub use flowmind_tools::ToolRegistry;
