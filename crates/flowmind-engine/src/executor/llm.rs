use tracing::debug;

use flowmind_core::approval::ApprovalDecision;
use flowmind_core::error::Result;

use super::{ExecEnv, Step};
use crate::graph::{FieldType, LlmConfig, Node, OutputField};
use crate::output_parser::output_schema;
use crate::state::{interpolate, VarLookup};
use crate::tool_loop::{self, LoopCheckpoint};

/// Render the prompts and run the tool-call loop from its first turn.
pub(crate) async fn start(
    env: ExecEnv<'_>,
    node: &Node,
    config: &LlmConfig,
    vars: &dyn VarLookup,
    item_index: Option<usize>,
) -> Result<Step> {
    let system = config
        .system
        .as_deref()
        .map(|s| interpolate(s, vars))
        .transpose()?;
    let mut prompt = interpolate(&config.prompt, vars)?;

    // Raw-captured fields never come from the model's answer.
    let answered: Vec<OutputField> = node
        .output
        .iter()
        .filter(|f| !config.raw_tool_output.contains_key(&f.name))
        .cloned()
        .collect();
    let schema = output_schema(&answered);
    if let Some(schema) = schema.as_ref().filter(|_| wants_json(&answered)) {
        prompt.push_str("\n\nRespond with a JSON object matching this schema:\n");
        prompt.push_str(&schema.to_string());
    }

    let tool_defs = env.tools.definitions_for(&config.tools);
    debug!(
        node = %node.name,
        tools = tool_defs.len(),
        fields = node.output.len(),
        "Starting LLM node"
    );

    let checkpoint = LoopCheckpoint::new(system, prompt, tool_defs, schema, item_index);
    tool_loop::drive(env, node, config, checkpoint).await
}

/// Continue a loop that stopped for tool approval.
pub(crate) async fn resume(
    env: ExecEnv<'_>,
    node: &Node,
    config: &LlmConfig,
    checkpoint: LoopCheckpoint,
    decision: ApprovalDecision,
) -> Result<Step> {
    tool_loop::resume(env, node, config, checkpoint, decision).await
}

/// A lone string field takes plain text; anything else needs JSON.
fn wants_json(answered: &[OutputField]) -> bool {
    match answered {
        [] => false,
        [field] => field.field_type != FieldType::String,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use flowmind_core::config::EngineConfig;
    use flowmind_core::error::FlowError;
    use flowmind_core::types::{ContentBlock, FlowEvent, RunId, Role, ToolResult};
    use flowmind_core::EventBus;
    use flowmind_test_utils::{FnTool, ScriptedModel, Turn};
    use flowmind_tools::ToolRegistry;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::executor::{NodeOutput, Pending};
    use crate::graph::OutputField;
    use crate::state::StateStore;

    struct Fixture {
        model: ScriptedModel,
        tools: ToolRegistry,
        config: EngineConfig,
        events: EventBus,
        run_id: RunId,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(turns: Vec<Turn>) -> Self {
            let mut tools = ToolRegistry::new();
            tools.register(FnTool::new("search", |input| {
                let q = input["q"].as_str().unwrap_or_default();
                Ok(ToolResult::success(format!("results for {q}")))
            }));
            tools.register(FnTool::new("fetch", |_| {
                Ok(ToolResult::success(r#"{"id": 7, "body": "page"}"#))
            }));
            Self {
                model: ScriptedModel::new(turns),
                tools,
                config: EngineConfig::default(),
                events: EventBus::default(),
                run_id: RunId::new(),
                cancel: CancellationToken::new(),
            }
        }

        fn env(&self) -> ExecEnv<'_> {
            ExecEnv {
                model: &self.model,
                tools: &self.tools,
                config: &self.config,
                events: &self.events,
                run_id: &self.run_id,
                cancel: &self.cancel,
            }
        }
    }

    fn complete(step: Step) -> NodeOutput {
        match step {
            Step::Complete(out) => out,
            Step::Suspend(pending) => panic!("unexpected suspension: {pending:?}"),
        }
    }

    fn tool_results(fixture: &Fixture, request: usize) -> Vec<(String, bool)> {
        fixture.model.requests()[request]
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|b| match b {
                ContentBlock::ToolResult { content, is_error, .. } => Some((content.clone(), *is_error)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_text_answer_fills_single_field() {
        let fixture = Fixture::new(vec![Turn::text("Paris")]);
        let config = LlmConfig::new("Capital of {country}?").with_system("Be brief.");
        let node = Node::llm("ask", config.clone()).with_output(OutputField::new("answer"));
        let mut state = StateStore::new();
        state.set("country", json!("France"));

        let out = complete(start(fixture.env(), &node, &config, &state, None).await.unwrap());
        assert_eq!(out.field("answer"), Some(&json!("Paris")));

        let request = &fixture.model.requests()[0];
        assert_eq!(request.system.as_deref(), Some("Be brief."));
        assert_eq!(request.messages[0].text(), "Capital of France?");
        assert!(request.tools.is_empty());
    }

    #[tokio::test]
    async fn tool_results_are_fed_back() {
        let fixture = Fixture::new(vec![
            Turn::tool_call("search", json!({"q": "rust"})),
            Turn::text(r#"{"summary": "found it", "hits": 3}"#),
        ]);
        let config = LlmConfig::new("Look it up").with_tools(&["search"]);
        let node = Node::llm("research", config.clone())
            .with_output(OutputField::new("summary"))
            .with_output(OutputField::new("hits").typed(FieldType::Int));

        let out = complete(
            start(fixture.env(), &node, &config, &StateStore::new(), None)
                .await
                .unwrap(),
        );
        assert_eq!(out.field("hits"), Some(&json!(3)));
        assert_eq!(out.tool_calls.len(), 1);
        assert!(out.tool_calls[0].decision.is_approved());

        let second = &fixture.model.requests()[1];
        assert_eq!(second.tools.len(), 1);
        assert_eq!(second.messages[1].role, Role::Assistant);
        assert_eq!(tool_results(&fixture, 1), vec![("results for rust".to_string(), false)]);
        assert!(second.messages[0].text().contains("JSON object matching this schema"));
    }

    #[tokio::test]
    async fn denied_tool_becomes_observation() {
        let mut fixture = Fixture::new(vec![
            Turn::tool_call("search", json!({"q": "secrets"})),
            Turn::text("I could not search."),
        ]);
        fixture.config.approval.deny.insert("search".into());
        let config = LlmConfig::new("Go").with_tools(&["search"]);
        let node = Node::llm("n", config.clone()).with_output(OutputField::new("answer"));

        let out = complete(
            start(fixture.env(), &node, &config, &StateStore::new(), None)
                .await
                .unwrap(),
        );
        assert_eq!(out.field("answer"), Some(&json!("I could not search.")));
        let observed = tool_results(&fixture, 1);
        assert!(observed[0].1);
        assert!(observed[0].0.contains("Approval denied for tool search"));
        assert!(!out.tool_calls[0].decision.is_approved());
    }

    #[tokio::test]
    async fn tool_outside_whitelist_is_rejected() {
        let fixture = Fixture::new(vec![
            Turn::tool_call("fetch", json!({})),
            Turn::text("ok"),
        ]);
        let config = LlmConfig::new("Go").with_tools(&["search"]);
        let node = Node::llm("n", config.clone()).with_output(OutputField::new("answer"));

        complete(
            start(fixture.env(), &node, &config, &StateStore::new(), None)
                .await
                .unwrap(),
        );
        let observed = tool_results(&fixture, 1);
        assert!(observed[0].0.contains("not available"));
    }

    #[tokio::test]
    async fn approval_suspends_and_resumes_same_turn() {
        let search = FnTool::new("search", |_| Ok(ToolResult::success("hit")));
        let calls = search.call_counter();
        let mut fixture = Fixture::new(vec![
            Turn::tool_call("search", json!({"q": "a"})),
            Turn::text("done"),
        ]);
        fixture.tools.register(search);
        let config = LlmConfig::new("Go").with_tools(&["search"]).with_approval();
        let node = Node::llm("n", config.clone()).with_output(OutputField::new("answer"));

        let step = start(fixture.env(), &node, &config, &StateStore::new(), None)
            .await
            .unwrap();
        let checkpoint = match step {
            Step::Suspend(Pending::Approval { request, checkpoint }) => {
                assert_eq!(request.tool_name, "search");
                assert_eq!(request.input, json!({"q": "a"}));
                checkpoint
            }
            other => panic!("expected approval, got {other:?}"),
        };
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let out = complete(
            resume(fixture.env(), &node, &config, *checkpoint, ApprovalDecision::Approved)
                .await
                .unwrap(),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.field("answer"), Some(&json!("done")));
        assert_eq!(fixture.model.requests().len(), 2);
    }

    #[tokio::test]
    async fn denial_on_resume_is_observed() {
        let fixture = Fixture::new(vec![
            Turn::tool_call("search", json!({"q": "a"})),
            Turn::text("skipped"),
        ]);
        let config = LlmConfig::new("Go").with_tools(&["search"]).with_approval();
        let node = Node::llm("n", config.clone()).with_output(OutputField::new("answer"));

        let Step::Suspend(Pending::Approval { checkpoint, .. }) =
            start(fixture.env(), &node, &config, &StateStore::new(), None)
                .await
                .unwrap()
        else {
            panic!("expected approval");
        };
        let decision = ApprovalDecision::Denied {
            reason: "not today".into(),
        };
        complete(resume(fixture.env(), &node, &config, *checkpoint, decision).await.unwrap());
        let observed = tool_results(&fixture, 1);
        assert!(observed[0].0.contains("not today"));
    }

    #[tokio::test]
    async fn raw_tool_output_skips_final_turn() {
        let fixture = Fixture::new(vec![Turn::tool_call("fetch", json!({"url": "x"}))]);
        let config = LlmConfig::new("Fetch it")
            .with_tools(&["fetch"])
            .with_raw_tool_output("page", "fetch");
        let node = Node::llm("n", config.clone())
            .with_output(OutputField::new("page").typed(FieldType::Map));

        let out = complete(
            start(fixture.env(), &node, &config, &StateStore::new(), None)
                .await
                .unwrap(),
        );
        assert_eq!(out.field("page"), Some(&json!({"id": 7, "body": "page"})));
        assert_eq!(fixture.model.requests().len(), 1);
        assert!(fixture.model.requests()[0].output_schema.is_none());
    }

    #[tokio::test]
    async fn raw_tool_output_shows_placeholder_to_model() {
        let fixture = Fixture::new(vec![
            Turn::tool_call("fetch", json!({})),
            Turn::text(r#"{"title": "Page"}"#),
        ]);
        let config = LlmConfig::new("Fetch")
            .with_tools(&["fetch"])
            .with_raw_tool_output("page", "fetch");
        let node = Node::llm("n", config.clone())
            .with_output(OutputField::new("page"))
            .with_output(OutputField::new("title"));

        let out = complete(
            start(fixture.env(), &node, &config, &StateStore::new(), None)
                .await
                .unwrap(),
        );
        assert_eq!(out.field("title"), Some(&json!("Page")));
        assert_eq!(out.field("page"), Some(&json!(r#"{"id": 7, "body": "page"}"#)));
        assert_eq!(
            tool_results(&fixture, 1)[0].0,
            "[output of 'fetch' stored in 'page']"
        );

        let schema = fixture.model.requests()[1]
            .output_schema
            .clone()
            .expect("schema for the answered field");
        assert_eq!(schema["required"], json!(["title"]));
        assert!(schema["properties"].get("page").is_none());
    }

    #[tokio::test]
    async fn step_cap_is_fatal() {
        let fixture = Fixture::new(vec![
            Turn::tool_call("search", json!({"q": "1"})),
            Turn::tool_call("search", json!({"q": "2"})),
            Turn::tool_call("search", json!({"q": "3"})),
        ]);
        let config = LlmConfig::new("Loop").with_tools(&["search"]).with_max_steps(2);
        let node = Node::llm("n", config.clone()).with_output(OutputField::new("answer"));

        let err = start(fixture.env(), &node, &config, &StateStore::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ToolLoopExceeded { max_steps: 2, .. }));
    }

    #[tokio::test]
    async fn unparseable_answer_is_reprompted() {
        let fixture = Fixture::new(vec![
            Turn::text("not json"),
            Turn::text(r#"{"score": 9}"#),
        ]);
        let mut rx = fixture.events.subscribe();
        let config = LlmConfig::new("Score it");
        let node = Node::llm("n", config.clone())
            .with_output(OutputField::new("score").typed(FieldType::Int));

        let out = complete(
            start(fixture.env(), &node, &config, &StateStore::new(), None)
                .await
                .unwrap(),
        );
        assert_eq!(out.field("score"), Some(&json!(9)));
        let retry_prompt = fixture.model.requests()[1].messages.last().unwrap().text();
        assert!(retry_prompt.contains("could not be used"));

        let mut saw_retry = false;
        while let Ok(event) = rx.try_recv() {
            saw_retry |= matches!(event, FlowEvent::RetryNotice { attempt: 1, .. });
        }
        assert!(saw_retry);
    }

    #[tokio::test]
    async fn parse_retries_are_bounded() {
        let fixture = Fixture::new(vec![Turn::text("a"), Turn::text("b"), Turn::text("c")]);
        let config = LlmConfig::new("Score it");
        let node = Node::llm("n", config.clone())
            .with_output(OutputField::new("score").typed(FieldType::Int));

        let err = start(fixture.env(), &node, &config, &StateStore::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::StructuredOutputParse { .. }));
        assert_eq!(fixture.model.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_are_retried_with_backoff() {
        let fixture = Fixture::new(vec![
            Turn::TransportError("503".into()),
            Turn::text("recovered"),
        ]);
        let config = LlmConfig::new("Hi");
        let node = Node::llm("n", config.clone()).with_output(OutputField::new("answer"));

        let out = complete(
            start(fixture.env(), &node, &config, &StateStore::new(), None)
                .await
                .unwrap(),
        );
        assert_eq!(out.field("answer"), Some(&json!("recovered")));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_exhaust_retries() {
        let fixture = Fixture::new(vec![
            Turn::TransportError("503".into()),
            Turn::TransportError("503".into()),
            Turn::TransportError("503".into()),
        ]);
        let config = LlmConfig::new("Hi");
        let node = Node::llm("n", config.clone()).with_output(OutputField::new("answer"));

        let err = start(fixture.env(), &node, &config, &StateStore::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ModelTransport(_)));
        assert_eq!(fixture.model.remaining(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_model_call() {
        let fixture = Fixture::new(vec![Turn::text("never")]);
        fixture.cancel.cancel();
        let config = LlmConfig::new("Hi");
        let node = Node::llm("n", config.clone());
        let err = start(fixture.env(), &node, &config, &StateStore::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
        assert_eq!(fixture.model.remaining(), 1);
    }
}
