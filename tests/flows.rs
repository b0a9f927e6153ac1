use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use flowmind::{
    ApprovalDecision, Edge, EngineConfig, FieldType, Flow, FlowDefinition, FlowError, FlowEvent,
    FlowRunner, ForEach, LlmConfig, Node, OutputField, Resume, RunStatus, Suspension, ToolConfig,
    ToolRegistry, ToolResult, UpdateAction, UpdateConfig, END, START,
};
use flowmind_test_utils::{init_tracing, last_user_text, FnModel, FnTool, ScriptedModel, Turn};

fn runner_with(
    definition: FlowDefinition,
    model: impl flowmind::ModelClient,
    tools: ToolRegistry,
    config: EngineConfig,
) -> FlowRunner {
    let flow = Flow::compile(definition).expect("flow compiles");
    FlowRunner::new(flow, Arc::new(model), Arc::new(tools), config).expect("runner builds")
}

#[test]
fn node_without_outgoing_edge_fails_validation() {
    let definition = FlowDefinition::new("dangling")
        .node(Node::output("a", &["hi"]))
        .node(Node::output("b", &["bye"]))
        .edge(Edge::always(START, "a"))
        .edge(Edge::always("a", "b"));

    let err = Flow::compile(definition).unwrap_err();
    assert!(matches!(err, FlowError::Structural(ref m) if m.contains("node 'b' has no outgoing edge")));
}

#[test]
fn append_with_two_fields_is_rejected() {
    let definition = FlowDefinition::new("bad append")
        .node(
            Node::update("push", UpdateConfig::action(UpdateAction::Append).from_source("new"))
                .with_output(OutputField::new("items"))
                .with_output(OutputField::new("other")),
        )
        .edge(Edge::always(START, "push"))
        .edge(Edge::always("push", END));

    let err = Flow::compile(definition).unwrap_err();
    assert!(matches!(err, FlowError::Structural(ref m) if m.contains("exactly one output field")));
}

#[tokio::test]
async fn first_true_condition_wins() {
    init_tracing();
    let definition = FlowDefinition::new("route")
        .node(Node::output("x", &["took X"]))
        .node(Node::output("y", &["took Y"]))
        .edge(Edge::branch(START).when("a > 1", "x").when("true", "y"))
        .edge(Edge::always("x", END))
        .edge(Edge::always("y", END));
    let runner = runner_with(
        definition,
        ScriptedModel::new(vec![]),
        ToolRegistry::new(),
        EngineConfig::default(),
    );

    let mut run = runner.start(HashMap::from([("a".to_string(), json!(2))]));
    let RunStatus::Done(outcome) = runner.advance(&mut run).await else {
        panic!("expected completion");
    };
    assert_eq!(outcome.transcript, vec!["took X".to_string()]);

    let mut run = runner.start(HashMap::from([("a".to_string(), json!(0))]));
    let RunStatus::Done(outcome) = runner.advance(&mut run).await else {
        panic!("expected completion");
    };
    assert_eq!(outcome.transcript, vec!["took Y".to_string()]);
}

#[tokio::test]
async fn no_matching_edge_fails_with_tried_conditions() {
    let definition = FlowDefinition::new("no fallback")
        .node(Node::output("x", &["x"]))
        .edge(Edge::branch(START).when("a > 1", "x"))
        .edge(Edge::always("x", END));
    let runner = runner_with(
        definition,
        ScriptedModel::new(vec![]),
        ToolRegistry::new(),
        EngineConfig::default(),
    );
    let mut run = runner.start(HashMap::from([("a".to_string(), json!(0))]));

    let RunStatus::Failed(failure) = runner.advance(&mut run).await else {
        panic!("expected failure");
    };
    assert!(matches!(failure.error, FlowError::NoMatchingEdge { .. }));
    assert!(failure.to_string().contains("a > 1"));
}

#[tokio::test]
async fn unknown_variable_fails_the_run() {
    let definition = FlowDefinition::new("typo")
        .node(Node::output("say", &["Hello {nmae}"]))
        .edge(Edge::always(START, "say"))
        .edge(Edge::always("say", END));
    let runner = runner_with(
        definition,
        ScriptedModel::new(vec![]),
        ToolRegistry::new(),
        EngineConfig::default(),
    );
    let mut run = runner.start(HashMap::from([("name".to_string(), json!("Ada"))]));

    let RunStatus::Failed(failure) = runner.advance(&mut run).await else {
        panic!("expected failure");
    };
    assert!(matches!(failure.error, FlowError::UnknownVariable(ref v) if v == "nmae"));
    assert_eq!(failure.node.as_deref(), Some("say"));
}

#[tokio::test]
async fn fanout_isolates_failures_and_run_continues() {
    let mut tools = ToolRegistry::new();
    let fetch = FnTool::new("fetch", |input| {
        let url = input["url"].as_str().unwrap_or_default().to_string();
        if url == "b" {
            return Ok(ToolResult::error("404 for b"));
        }
        Ok(ToolResult::success(format!("page {url}")))
    });
    let fetch_calls = fetch.call_counter();
    tools.register(fetch);

    let definition = FlowDefinition::new("crawl")
        .node(
            Node::tool("fetch_all", ToolConfig::new("fetch").with_arg("url", json!("{url}")))
                .with_output(OutputField::new("body"))
                .with_foreach(ForEach::new("{urls}", "pages").with_item_name("url")),
        )
        .node(Node::output("report", &["crawl finished"]))
        .edge(Edge::always(START, "fetch_all"))
        .edge(Edge::always("fetch_all", "report"))
        .edge(Edge::always("report", END));
    let runner = runner_with(
        definition,
        ScriptedModel::new(vec![]),
        tools,
        EngineConfig::default(),
    );
    let mut run = runner.start(HashMap::from([("urls".to_string(), json!(["a", "b", "c"]))]));

    let status = runner.advance(&mut run).await;
    let RunStatus::Done(outcome) = status else {
        panic!("expected completion, got {status:?}");
    };
    let pages = outcome.state["pages"].as_array().unwrap();
    let statuses: Vec<_> = pages.iter().map(|p| p["status"].as_str().unwrap()).collect();
    assert_eq!(statuses, vec!["ok", "error", "ok"]);
    assert_eq!(pages[0]["output"]["body"], "page a");
    assert_eq!(pages[2]["item"], "c");
    assert!(pages[1]["error"].as_str().unwrap().contains("404 for b"));
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn denied_tool_call_is_observed_and_run_continues() {
    let mut tools = ToolRegistry::new();
    tools.register(FnTool::new("wipe_disk", |_| Ok(ToolResult::success("wiped"))));
    let mut config = EngineConfig::default();
    config.approval.deny.insert("wipe_disk".into());

    let model = ScriptedModel::new(vec![
        Turn::tool_call("wipe_disk", json!({})),
        Turn::text("I was not allowed to do that."),
    ]);
    let definition = FlowDefinition::new("guarded")
        .node(
            Node::llm("agent", LlmConfig::new("Free some space").with_tools(&["wipe_disk"]))
                .with_output(OutputField::new("reply")),
        )
        .node(Node::output("show", &["{reply}"]))
        .edge(Edge::always(START, "agent"))
        .edge(Edge::always("agent", "show"))
        .edge(Edge::always("show", END));
    let runner = runner_with(definition, model, tools, config);
    let mut run = runner.start(HashMap::new());

    let RunStatus::Done(outcome) = runner.advance(&mut run).await else {
        panic!("expected completion");
    };
    assert_eq!(outcome.transcript, vec!["I was not allowed to do that.".to_string()]);
}

#[tokio::test]
async fn approval_denied_by_caller_keeps_going() {
    let mut tools = ToolRegistry::new();
    let send = FnTool::new("send_email", |_| Ok(ToolResult::success("sent")));
    let sends = send.call_counter();
    tools.register(send);

    let model = FnModel::new(|req| {
        let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let denied = last.iter().any(|b| {
            matches!(b, flowmind::ContentBlock::ToolResult { is_error: true, .. })
        });
        if denied {
            Turn::text("Draft kept, not sent.")
        } else {
            Turn::tool_call("send_email", json!({"to": "boss"}))
        }
    });
    let definition = FlowDefinition::new("mailer")
        .node(
            Node::llm(
                "mail",
                LlmConfig::new("Send the report")
                    .with_tools(&["send_email"])
                    .with_approval(),
            )
            .with_output(OutputField::new("status").user_message()),
        )
        .edge(Edge::always(START, "mail"))
        .edge(Edge::always("mail", END));
    let runner = runner_with(definition, model, tools, EngineConfig::default());
    let mut events = runner.events().subscribe();
    let mut run = runner.start(HashMap::new());

    let RunStatus::Waiting(Suspension::AwaitingApproval { request, .. }) = runner.advance(&mut run).await
    else {
        panic!("expected approval request");
    };
    assert!(request.question().contains("send_email"));

    let decision = ApprovalDecision::Denied {
        reason: "not today".into(),
    };
    let status = runner.resume(&mut run, Resume::Approval(decision)).await.unwrap();
    let RunStatus::Done(outcome) = status else {
        panic!("expected completion");
    };
    assert_eq!(outcome.state["status"], json!("Draft kept, not sent."));
    assert_eq!(sends.load(Ordering::SeqCst), 0);

    let mut user_messages = Vec::new();
    let mut resolved = None;
    while let Ok(event) = events.try_recv() {
        match event {
            FlowEvent::UserMessage { value, .. } => user_messages.push(value),
            FlowEvent::ApprovalResolved { approved, .. } => resolved = Some(approved),
            _ => {}
        }
    }
    assert_eq!(user_messages, vec![json!("Draft kept, not sent.")]);
    assert_eq!(resolved, Some(false));
}

#[tokio::test]
async fn review_loop_from_json_definition() {
    let definition: FlowDefinition = serde_json::from_value(json!({
        "description": "draft and review until approved",
        "nodes": [
            {
                "name": "draft",
                "type": "llm",
                "prompt": "Write about {topic}. Previous feedback: {feedback}",
                "output": [{"name": "text"}],
                "limit": 3,
                "limit_counter_field": "drafts"
            },
            {
                "name": "review",
                "type": "llm",
                "system": "You are a strict reviewer.",
                "prompt": "Review: {text}",
                "output": [
                    {"name": "approved", "type": "bool"},
                    {"name": "feedback", "description": "What to fix"}
                ]
            },
            {
                "name": "log",
                "type": "update_state",
                "action": "append",
                "source": "feedback",
                "output": [{"name": "history", "type": "list"}]
            },
            {
                "name": "publish",
                "type": "output",
                "values": ["Published after {drafts} drafts: {text}"]
            }
        ],
        "edges": [
            {"from": "START", "to": "draft"},
            {"from": "draft", "to": "review"},
            {"from": "review", "to": "log"},
            {"from": "log", "conditions": [
                {"condition": "approved", "to": "publish"},
                {"condition": "drafts < 3", "to": "draft"},
                {"condition": "true", "to": "publish"}
            ]},
            {"from": "publish", "to": "END"}
        ]
    }))
    .expect("definition deserializes");

    let model = FnModel::new(|req| {
        let prompt = last_user_text(req);
        if prompt.starts_with("Review:") {
            if prompt.contains("v2") {
                Turn::text(r#"{"approved": true, "feedback": "good"}"#)
            } else {
                Turn::text(r#"```json
{"approved": "false", "feedback": "too short"}
```"#)
            }
        } else if prompt.contains("too short") {
            Turn::text("v2 of the essay")
        } else {
            Turn::text("v1")
        }
    });
    let runner = runner_with(definition, model, ToolRegistry::new(), EngineConfig::default());
    let mut run = runner.start(HashMap::from([
        ("topic".to_string(), json!("rust")),
        ("feedback".to_string(), json!("none")),
    ]));

    let status = runner.advance(&mut run).await;
    let RunStatus::Done(outcome) = status else {
        panic!("expected completion, got {status:?}");
    };
    assert_eq!(
        outcome.transcript,
        vec!["Published after 2 drafts: v2 of the essay".to_string()]
    );
    assert_eq!(outcome.state["history"], json!(["too short", "good"]));
    assert_eq!(outcome.steps, 7);
}

#[tokio::test]
async fn cancel_token_stops_between_nodes() {
    let definition = FlowDefinition::new("two steps")
        .node(
            Node::llm("think", LlmConfig::new("hi"))
                .with_output(OutputField::new("n").typed(FieldType::Int)),
        )
        .node(Node::output("say", &["{n}"]))
        .edge(Edge::always(START, "think"))
        .edge(Edge::always("think", "say"))
        .edge(Edge::always("say", END));
    let runner = runner_with(
        definition,
        ScriptedModel::new(vec![Turn::text("1")]),
        ToolRegistry::new(),
        EngineConfig::default(),
    );
    let mut run = runner.start(HashMap::new());
    run.cancel_token().cancel();

    let RunStatus::Failed(failure) = runner.advance(&mut run).await else {
        panic!("expected failure");
    };
    assert!(matches!(failure.error, FlowError::Cancelled));
    assert!(run.transcript().is_empty());
}
