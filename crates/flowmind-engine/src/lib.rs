//! Declarative LLM workflow engine.
//!
//! A [`FlowDefinition`] (nodes plus edges) is compiled into a [`Flow`] once,
//! then executed by a [`FlowRunner`] against a shared state store. Nodes
//! prompt the model, call tools, ask the caller for input, emit output or
//! update state; edges route on conditions evaluated against that state.

pub mod executor;
pub mod expr;
pub mod fanout;
pub mod graph;
pub mod output_parser;
pub mod retry;
pub mod runner;
pub mod state;
mod tool_loop;

pub use executor::NodeOutput;
pub use expr::Condition;
pub use fanout::FanoutSummary;
pub use graph::{
    Edge, FieldType, Flow, FlowDefinition, ForEach, InputOptions, LlmConfig, Node, NodeKind,
    OutputField, ToolConfig, UpdateAction, UpdateConfig, END, START,
};
pub use runner::{FlowRunner, Resume, Run, RunFailure, RunOutcome, RunStatus, Suspension};
pub use state::{interpolate, Scope, StateStore, VarLookup};
