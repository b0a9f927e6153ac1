//! Flow graph: nodes, edges and compile-time validation.
//!
//! A flow is a directed graph of [`Node`]s joined by [`Edge`]s, entered at
//! the `START` sentinel and left at `END`. [`Flow::compile`] checks the
//! structure once, parses every edge condition, and builds the ordered
//! route table the runner walks.

pub mod edge;
pub mod flow;
pub mod node;

pub use edge::{ConditionalTarget, Edge};
pub use flow::{Flow, FlowDefinition, Route, END, START};
pub use node::{
    FieldType, ForEach, InputConfig, InputOptions, LlmConfig, Node, NodeKind, OutputConfig,
    OutputField, ToolConfig, UpdateAction, UpdateConfig,
};
