//! Parallel fan-out over a list held in state.
//!
//! A `foreach` node runs once per list element on a bounded worker pool.
//! Workers only read the shared state through a private [`Scope`]; their
//! results are slotted by original index and merged after the last one
//! finishes, so one failing item never affects the others.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flowmind_core::error::{FlowError, Result};
use flowmind_core::types::FlowEvent;

use crate::executor::{llm, tool, ExecEnv, NodeOutput, Step};
use crate::graph::{ForEach, Node, NodeKind};
use crate::state::{type_name, Scope, StateStore, VarLookup};

/// Outcome counts of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub(crate) async fn run(
    env: ExecEnv<'_>,
    node: &Node,
    foreach: &ForEach,
    state: &StateStore,
) -> Result<NodeOutput> {
    let key = foreach.items_key();
    let items = match state.get(key) {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(FlowError::TypeMismatch {
                key: key.to_string(),
                expected: "list".into(),
                found: type_name(other).into(),
            })
        }
        None => return Err(FlowError::UnknownVariable(key.to_string())),
    };

    let total = items.len();
    let workers = foreach
        .max_workers
        .unwrap_or(env.config.engine.max_workers)
        .max(1);
    info!(node = %node.name, total, workers, "Fanning out");

    // Started items run to completion; only dispatch watches the run token.
    let worker_cancel = CancellationToken::new();
    let worker_env = ExecEnv {
        cancel: &worker_cancel,
        ..env
    };
    let started = AtomicUsize::new(0);
    let completed = AtomicUsize::new(0);
    let progress = |started: usize, completed: usize| {
        env.events.publish(FlowEvent::FanoutProgress {
            node: node.name.clone(),
            started,
            completed,
            active: started.saturating_sub(completed),
            total,
        });
    };

    let mut results = stream::iter(items.iter().enumerate())
        .map(|(index, item)| {
            let (started, completed, progress) = (&started, &completed, &progress);
            async move {
                if env.cancel.is_cancelled() {
                    return (index, None);
                }
                let now_started = started.fetch_add(1, Ordering::SeqCst) + 1;
                progress(now_started, completed.load(Ordering::SeqCst));

                let scope = Scope::new(state)
                    .with_local(&foreach.item_name, item.clone())
                    .with_local(foreach.index_name(), json!(index));
                let result = run_item(worker_env, node, &scope, index).await;

                let now_completed = completed.fetch_add(1, Ordering::SeqCst) + 1;
                progress(started.load(Ordering::SeqCst), now_completed);
                (index, Some(result))
            }
        })
        .buffer_unordered(workers);

    let mut slots: Vec<Option<Result<NodeOutput>>> = (0..total).map(|_| None).collect();
    while let Some((index, result)) = results.next().await {
        slots[index] = result;
    }
    drop(results);

    let mut summary = FanoutSummary {
        total,
        ..FanoutSummary::default()
    };
    let mut aggregate = Vec::with_capacity(total);
    let mut tool_calls = Vec::new();

    for (index, (item, slot)) in items.into_iter().zip(slots).enumerate() {
        let entry = match slot {
            Some(Ok(out)) => {
                summary.succeeded += 1;
                tool_calls.extend(out.tool_calls);
                let fields: Map<String, Value> = out.fields.into_iter().collect();
                json!({ "index": index, "item": item, "status": "ok", "output": fields })
            }
            Some(Err(e)) => {
                summary.failed += 1;
                let failure = FlowError::FanoutItem {
                    index,
                    message: e.to_string(),
                };
                warn!(node = %node.name, error = %failure, "Fan-out item failed");
                json!({ "index": index, "item": item, "status": "error", "error": e.to_string() })
            }
            None => {
                summary.failed += 1;
                json!({ "index": index, "item": item, "status": "error", "error": "cancelled" })
            }
        };
        aggregate.push(entry);
    }

    info!(
        node = %node.name,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Fan-out finished"
    );

    Ok(NodeOutput {
        fields: vec![(foreach.output.clone(), Value::Array(aggregate))],
        tool_calls,
        fanout: Some(summary),
        ..NodeOutput::default()
    })
}

async fn run_item(
    env: ExecEnv<'_>,
    node: &Node,
    vars: &dyn VarLookup,
    index: usize,
) -> Result<NodeOutput> {
    match &node.kind {
        NodeKind::Tool(config) => tool::run(env, node, config, vars, Some(index)).await,
        NodeKind::Llm(config) => match llm::start(env, node, config, vars, Some(index)).await? {
            Step::Complete(out) => Ok(out),
            Step::Suspend(_) => Err(FlowError::Structural(format!(
                "fan-out node '{}' cannot wait for approval",
                node.name
            ))),
        },
        other => Err(FlowError::Structural(format!(
            "foreach is not supported on {} nodes",
            other.label()
        ))),
    }
}
