//! The flow runner: walks a compiled [`Flow`] from `START` to `END`.
//!
//! A [`Run`] carries everything that changes while a flow executes: the
//! state store, pre-supplied input values, the transcript, and a cursor
//! saying where traversal stands. [`FlowRunner::advance`] drives the cursor
//! until the flow ends, fails, or a node needs something from the caller.
//! In the last case the run is handed back as [`RunStatus::Waiting`] and
//! [`FlowRunner::resume`] continues the same node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowmind_core::approval::{ApprovalDecision, ApprovalRequest};
use flowmind_core::config::EngineConfig;
use flowmind_core::error::{FlowError, Result};
use flowmind_core::traits::ModelClient;
use flowmind_core::types::{FlowEvent, RunId, WaitReason};
use flowmind_core::EventBus;
use flowmind_tools::ToolRegistry;

use crate::executor::{input, llm, output, tool, update, ExecEnv, NodeOutput, Pending, Step};
use crate::fanout;
use crate::graph::{Flow, Node, NodeKind, END, START};
use crate::state::{type_name, StateStore};

/// Where traversal stands.
#[derive(Debug)]
enum Cursor {
    /// About to execute the named node.
    Entering(String),
    /// The named node finished; pick its outgoing route.
    Leaving(String),
    /// The named node waits for the caller.
    Suspended { node: String, pending: Pending },
    /// Finished, failed or cancelled.
    Closed,
}

/// One execution of a flow.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    state: StateStore,
    inputs: HashMap<String, Value>,
    cursor: Cursor,
    transcript: Vec<String>,
    steps: usize,
    cancel: CancellationToken,
}

impl Run {
    fn new(params: HashMap<String, Value>) -> Self {
        Self {
            id: RunId::new(),
            state: StateStore::from_map(params),
            inputs: HashMap::new(),
            cursor: Cursor::Leaving(START.to_string()),
            transcript: Vec::new(),
            steps: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Pre-supply values for Input nodes, keyed by node name.
    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Pre-supply the value for one Input node. It is consumed on first use.
    pub fn provide_input(&mut self, node: impl Into<String>, value: Value) {
        self.inputs.insert(node.into(), value);
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Lines emitted by Output nodes so far.
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// Node executions so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// What the run is waiting for, if it is suspended.
    pub fn suspension(&self) -> Option<Suspension> {
        match &self.cursor {
            Cursor::Suspended { node, pending } => Some(Suspension::from_pending(node, pending)),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.cursor, Cursor::Closed)
    }

    /// Token that cancels this run when triggered from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Caller's answer to a suspension.
#[derive(Debug, Clone)]
pub enum Resume {
    Input(Value),
    Approval(ApprovalDecision),
}

/// Why a run handed control back to its caller.
#[derive(Debug, Clone)]
pub enum Suspension {
    AwaitingInput {
        node: String,
        prompt: String,
        options: Option<Vec<Value>>,
    },
    AwaitingApproval {
        node: String,
        request: ApprovalRequest,
    },
}

impl Suspension {
    fn from_pending(node: &str, pending: &Pending) -> Self {
        match pending {
            Pending::Input { prompt, options } => Self::AwaitingInput {
                node: node.to_string(),
                prompt: prompt.clone(),
                options: options.clone(),
            },
            Pending::Approval { request, .. } => Self::AwaitingApproval {
                node: node.to_string(),
                request: request.clone(),
            },
        }
    }

    pub fn reason(&self) -> WaitReason {
        match self {
            Self::AwaitingInput { .. } => WaitReason::AwaitingInput,
            Self::AwaitingApproval { .. } => WaitReason::AwaitingApproval,
        }
    }

    pub fn node(&self) -> &str {
        match self {
            Self::AwaitingInput { node, .. } | Self::AwaitingApproval { node, .. } => node,
        }
    }
}

/// Where a call to `advance` or `resume` left the run.
#[derive(Debug)]
pub enum RunStatus {
    Waiting(Suspension),
    Done(RunOutcome),
    Failed(RunFailure),
}

impl RunStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Final state of a run that reached `END`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: HashMap<String, Value>,
    pub transcript: Vec<String>,
    pub steps: usize,
}

/// A run that stopped on an error. Its state is discarded.
#[derive(Debug)]
pub struct RunFailure {
    pub run_id: RunId,
    pub node: Option<String>,
    pub error: FlowError,
    pub suggestion: Option<&'static str>,
}

impl RunFailure {
    fn new(run_id: RunId, node: Option<String>, error: FlowError) -> Self {
        let suggestion = error.suggestion();
        Self {
            run_id,
            node,
            error,
            suggestion,
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node {
            Some(node) => writeln!(f, "Run {} failed at node '{node}': {}", self.run_id, self.error)?,
            None => writeln!(f, "Run {} failed: {}", self.run_id, self.error)?,
        }
        if let Some(suggestion) = self.suggestion {
            writeln!(f, "  suggestion: {suggestion}")?;
        }
        write!(f, "  cause: {:?}", self.error)
    }
}

/// Executes runs of one compiled flow.
pub struct FlowRunner {
    flow: Flow,
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    config: EngineConfig,
    events: EventBus,
}

impl FlowRunner {
    /// Bind a flow to its capabilities. Every tool the flow names must be
    /// registered.
    pub fn new(
        flow: Flow,
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        config: EngineConfig,
    ) -> Result<Self> {
        let missing: Vec<&str> = flow
            .tool_names()
            .into_iter()
            .filter(|name| !tools.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(FlowError::Structural(format!(
                "unregistered tools: {}",
                missing.join(", ")
            )));
        }
        Ok(Self {
            flow,
            model,
            tools,
            config,
            events: EventBus::default(),
        })
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a run seeded with caller parameters. Nothing executes yet.
    pub fn start(&self, params: HashMap<String, Value>) -> Run {
        let run = Run::new(params);
        info!(run_id = %run.id, flow = %self.flow.description(), "Starting flow run");
        self.events.publish(FlowEvent::RunStarted {
            run_id: run.id.clone(),
        });
        run
    }

    /// Drive the run until it finishes, fails, or waits on the caller.
    pub async fn advance(&self, run: &mut Run) -> RunStatus {
        loop {
            if run.cancel.is_cancelled() && !run.is_finished() {
                return self.fail(run, None, FlowError::Cancelled);
            }

            match std::mem::replace(&mut run.cursor, Cursor::Closed) {
                Cursor::Closed => return already_finished(run),
                Cursor::Suspended { node, pending } => {
                    let suspension = Suspension::from_pending(&node, &pending);
                    run.cursor = Cursor::Suspended { node, pending };
                    return RunStatus::Waiting(suspension);
                }
                Cursor::Leaving(from) => match self.flow.select_route(&from, &run.state) {
                    Ok(to) if to == END => return self.finish(run),
                    Ok(to) => {
                        debug!(from = %from, to = %to, "Following edge");
                        run.cursor = Cursor::Entering(to.to_string());
                    }
                    Err(e) => return self.fail(run, Some(from), e),
                },
                Cursor::Entering(name) => {
                    let started = Instant::now();
                    let result = self.execute(run, &name).await;
                    if let Some(status) = self.settle(run, name, result, started) {
                        return status;
                    }
                }
            }
        }
    }

    /// Answer a suspension and keep driving the run.
    ///
    /// A rejected answer (a value outside the node's options, or the wrong
    /// kind of answer) is returned as `InvalidResume` and the run stays
    /// suspended on the same request.
    pub async fn resume(&self, run: &mut Run, resume: Resume) -> Result<RunStatus> {
        let (name, pending) = match std::mem::replace(&mut run.cursor, Cursor::Closed) {
            Cursor::Suspended { node, pending } => (node, pending),
            other => {
                run.cursor = other;
                return Err(FlowError::InvalidResume("run is not waiting on its caller".into()));
            }
        };
        if run.cancel.is_cancelled() {
            return Ok(self.fail(run, Some(name), FlowError::Cancelled));
        }
        let Some(node) = self.flow.node(&name) else {
            let error = FlowError::Structural(format!("unknown node '{name}'"));
            return Ok(self.fail(run, Some(name), error));
        };

        let started = Instant::now();
        let result = match (pending, resume) {
            (Pending::Input { prompt, options }, Resume::Input(value)) => {
                match input::accept(node, value, options.as_deref()) {
                    Ok(out) => Ok(Step::Complete(out)),
                    Err(e) => {
                        warn!(node = %name, error = %e, "Rejected input");
                        run.cursor = Cursor::Suspended {
                            node: name,
                            pending: Pending::Input { prompt, options },
                        };
                        return Err(e);
                    }
                }
            }
            (Pending::Approval { request, checkpoint }, Resume::Approval(decision)) => {
                info!(
                    node = %name,
                    tool = %request.tool_name,
                    approved = decision.is_approved(),
                    "Approval resolved"
                );
                self.events.publish(FlowEvent::ApprovalResolved {
                    request_id: request.id.clone(),
                    approved: decision.is_approved(),
                });
                match &node.kind {
                    NodeKind::Llm(config) => {
                        let env = self.env(&run.id, &run.cancel);
                        llm::resume(env, node, config, *checkpoint, decision).await
                    }
                    other => Err(FlowError::Structural(format!(
                        "{} node '{name}' cannot wait for approval",
                        other.label()
                    ))),
                }
            }
            (pending, resume) => {
                let expected = Suspension::from_pending(&name, &pending).reason();
                run.cursor = Cursor::Suspended {
                    node: name.clone(),
                    pending,
                };
                let given = match resume {
                    Resume::Input(_) => "an input value",
                    Resume::Approval(_) => "an approval decision",
                };
                return Err(FlowError::InvalidResume(format!(
                    "node '{name}' is {expected}, got {given}"
                )));
            }
        };

        match self.settle(run, name, result, started) {
            Some(status) => Ok(status),
            None => Ok(self.advance(run).await),
        }
    }

    /// Cancel a run. A running node stops at its next await point and
    /// writes nothing; a suspended run fails immediately.
    pub fn cancel(&self, run: &mut Run) -> RunStatus {
        run.cancel.cancel();
        let node = match &run.cursor {
            Cursor::Suspended { node, .. } | Cursor::Entering(node) | Cursor::Leaving(node) => {
                Some(node.clone())
            }
            Cursor::Closed => None,
        };
        if run.is_finished() {
            return already_finished(run);
        }
        self.fail(run, node, FlowError::Cancelled)
    }

    fn env<'a>(&'a self, run_id: &'a RunId, cancel: &'a CancellationToken) -> ExecEnv<'a> {
        ExecEnv {
            model: self.model.as_ref(),
            tools: self.tools.as_ref(),
            config: &self.config,
            events: &self.events,
            run_id,
            cancel,
        }
    }

    async fn execute(&self, run: &mut Run, name: &str) -> Result<Step> {
        let node = self
            .flow
            .node(name)
            .ok_or_else(|| FlowError::Structural(format!("unknown node '{name}'")))?;

        let budget = self.config.engine.max_run_steps;
        if run.steps >= budget {
            return Err(FlowError::StepBudgetExceeded(budget));
        }
        run.steps += 1;
        bump_loop_counter(node, &mut run.state)?;

        info!(
            run_id = %run.id,
            node = %name,
            kind = node.kind.label(),
            step = run.steps,
            "Executing flow node"
        );
        self.events.publish(FlowEvent::NodeStarted {
            node: name.to_string(),
        });

        let supplied = match node.kind {
            NodeKind::Input(_) => run.inputs.remove(name),
            _ => None,
        };
        let env = self.env(&run.id, &run.cancel);
        let state = &run.state;

        if let Some(foreach) = &node.foreach {
            return fanout::run(env, node, foreach, state).await.map(Step::Complete);
        }
        match &node.kind {
            NodeKind::Input(config) => input::prepare(node, config, state, supplied),
            NodeKind::Llm(config) => llm::start(env, node, config, state, None).await,
            NodeKind::Tool(config) => tool::run(env, node, config, state, None)
                .await
                .map(Step::Complete),
            NodeKind::Output(config) => output::run(config, state).map(Step::Complete),
            NodeKind::UpdateState(config) => update::run(node, config, state).map(Step::Complete),
        }
    }

    /// Apply a node's result. Returns a status when traversal must stop.
    fn settle(
        &self,
        run: &mut Run,
        name: String,
        result: Result<Step>,
        started: Instant,
    ) -> Option<RunStatus> {
        match result {
            Err(e) => Some(self.fail(run, Some(name), e)),
            Ok(_) if run.cancel.is_cancelled() => Some(self.fail(run, Some(name), FlowError::Cancelled)),
            Ok(Step::Suspend(pending)) => Some(self.suspend(run, name, pending)),
            Ok(Step::Complete(out)) => {
                self.commit(run, &name, out, started.elapsed());
                run.cursor = Cursor::Leaving(name);
                None
            }
        }
    }

    fn commit(&self, run: &mut Run, name: &str, out: NodeOutput, elapsed: Duration) {
        let node = self.flow.node(name);
        for (field, value) in &out.fields {
            let flagged = node
                .and_then(|n| n.field(field))
                .is_some_and(|f| f.user_message);
            if flagged {
                self.events.publish(FlowEvent::UserMessage {
                    node: name.to_string(),
                    field: field.clone(),
                    value: value.clone(),
                });
            }
        }
        for line in out.lines {
            self.events.publish(FlowEvent::Output {
                node: name.to_string(),
                text: line.clone(),
            });
            run.transcript.push(line);
        }
        if !out.tool_calls.is_empty() {
            debug!(node = %name, tool_calls = out.tool_calls.len(), "Node made tool calls");
        }

        run.state.merge(out.fields);
        self.events.publish(FlowEvent::NodeCompleted {
            node: name.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    fn suspend(&self, run: &mut Run, name: String, pending: Pending) -> RunStatus {
        let suspension = Suspension::from_pending(&name, &pending);
        match &suspension {
            Suspension::AwaitingInput {
                node,
                prompt,
                options,
            } => self.events.publish(FlowEvent::InputRequested {
                node: node.clone(),
                prompt: prompt.clone(),
                options: options.clone(),
            }),
            Suspension::AwaitingApproval { request, .. } => {
                self.events.publish(FlowEvent::ApprovalRequested {
                    request: request.clone(),
                })
            }
        }
        info!(run_id = %run.id, node = %name, reason = %suspension.reason(), "Run waiting on caller");
        run.cursor = Cursor::Suspended {
            node: name,
            pending,
        };
        RunStatus::Waiting(suspension)
    }

    fn finish(&self, run: &mut Run) -> RunStatus {
        run.cursor = Cursor::Closed;
        info!(run_id = %run.id, steps = run.steps, "Flow run completed");
        self.events.publish(FlowEvent::RunCompleted {
            run_id: run.id.clone(),
            steps: run.steps,
        });
        RunStatus::Done(RunOutcome {
            run_id: run.id.clone(),
            state: std::mem::take(&mut run.state).into_inner(),
            transcript: std::mem::take(&mut run.transcript),
            steps: run.steps,
        })
    }

    fn fail(&self, run: &mut Run, node: Option<String>, error: FlowError) -> RunStatus {
        run.cursor = Cursor::Closed;
        run.state = StateStore::new();
        error!(run_id = %run.id, node = ?node, error = %error, "Flow run failed");
        self.events.publish(FlowEvent::RunFailed {
            run_id: run.id.clone(),
            error: error.to_string(),
        });
        RunStatus::Failed(RunFailure::new(run.id.clone(), node, error))
    }
}

fn already_finished(run: &Run) -> RunStatus {
    RunStatus::Failed(RunFailure::new(
        run.id.clone(),
        None,
        FlowError::InvalidResume("run has already finished".into()),
    ))
}

/// Count one execution of a loop-bounded node, refusing past its limit.
fn bump_loop_counter(node: &Node, state: &mut StateStore) -> Result<()> {
    let (Some(limit), Some(counter)) = (node.limit, node.limit_counter_field.as_deref()) else {
        return Ok(());
    };
    let current = match state.get(counter) {
        None => 0,
        Some(value) => value.as_u64().ok_or_else(|| FlowError::TypeMismatch {
            key: counter.to_string(),
            expected: "int".into(),
            found: type_name(value).into(),
        })?,
    };
    if current >= limit {
        return Err(FlowError::LoopLimitExceeded {
            node: node.name.clone(),
            limit,
            counter: counter.to_string(),
        });
    }
    state.set(counter, json!(current + 1));
    Ok(())
}
