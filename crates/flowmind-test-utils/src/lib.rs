//! Shared mocks and fixtures for flowmind tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use flowmind_core::error::{FlowError, Result};
use flowmind_core::traits::{ModelClient, Tool};
use flowmind_core::types::*;

/// Install a test-friendly tracing subscriber (honours `RUST_LOG`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum Turn {
    /// A final text answer.
    Text(String),
    /// Tool calls (name, input), optionally preceded by text.
    ToolCalls {
        text: String,
        calls: Vec<(String, serde_json::Value)>,
    },
    /// `generate` fails with a transport error.
    TransportError(String),
}

impl Turn {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tool_call(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolCalls {
            text: String::new(),
            calls: vec![(name.into(), input)],
        }
    }
}

fn turn_into_deltas(turn: Turn, ids: &AtomicUsize) -> Result<Vec<StreamDelta>> {
    match turn {
        Turn::Text(text) => Ok(vec![
            StreamDelta::TextDelta(text),
            StreamDelta::Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            StreamDelta::Stop(StopReason::EndTurn),
        ]),
        Turn::ToolCalls { text, calls } => {
            let mut deltas = Vec::new();
            if !text.is_empty() {
                deltas.push(StreamDelta::TextDelta(text));
            }
            for (index, (name, input)) in calls.into_iter().enumerate() {
                let id = format!("call_{}", ids.fetch_add(1, Ordering::SeqCst));
                deltas.push(StreamDelta::ToolUseStart { index, id, name });
                deltas.push(StreamDelta::ToolInputDelta {
                    index,
                    delta: input.to_string(),
                });
            }
            deltas.push(StreamDelta::Stop(StopReason::ToolUse));
            Ok(deltas)
        }
        Turn::TransportError(msg) => Err(FlowError::ModelTransport(msg)),
    }
}

/// A model that replays a fixed script of turns and records every request.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Turn>>,
    requests: Mutex<Vec<ModelRequest>>,
    ids: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            ids: AtomicUsize::new(0),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Turns not yet consumed.
    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

impl ModelClient for ScriptedModel {
    fn generate(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let turn = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| FlowError::ModelTransport("script exhausted".into()))?;
            let deltas = turn_into_deltas(turn, &self.ids)?;
            Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
        })
    }
}

type Responder = dyn Fn(&ModelRequest) -> Turn + Send + Sync;

/// A model whose answer is computed from the request (order-independent).
pub struct FnModel {
    respond: Box<Responder>,
    ids: AtomicUsize,
    calls: AtomicUsize,
}

impl FnModel {
    pub fn new(respond: impl Fn(&ModelRequest) -> Turn + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            ids: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelClient for FnModel {
    fn generate(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let deltas = turn_into_deltas((self.respond)(&request), &self.ids)?;
            Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
        })
    }
}

/// Last user-visible text of a request, handy for routing in `FnModel`.
pub fn last_user_text(request: &ModelRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User && !m.text().is_empty())
        .map(|m| m.text())
        .unwrap_or_default()
}

type ToolFn = dyn Fn(serde_json::Value) -> Result<ToolResult> + Send + Sync;

/// A tool backed by a closure; counts its invocations.
pub struct FnTool {
    name: String,
    handler: Box<ToolFn>,
    output_schema: Option<serde_json::Value>,
    calls: Arc<AtomicUsize>,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(serde_json::Value) -> Result<ToolResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handler: Box::new(handler),
            output_schema: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Shared invocation counter (clone it before registering the tool).
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Test tool"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn output_schema(&self) -> Option<serde_json::Value> {
        self.output_schema.clone()
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.handler)(input);
        Box::pin(async move { result })
    }
}

/// A tool that sleeps before answering, for timeout and concurrency tests.
pub struct SlowTool {
    name: String,
    timeout_secs: u64,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: impl Into<String>, timeout_secs: u64, delay: Duration) -> Self {
        Self {
            name: name.into(),
            timeout_secs,
            delay,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sleeps, then echoes its input"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(ToolResult::success(input.to_string()))
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}
