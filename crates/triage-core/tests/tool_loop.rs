use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use triage_core::{
    sha256_hex, split_artifact, ArtifactSettings, ArtifactStore, EngineError, Orchestrator,
    RateLimiter, RequestEngine, RetryPolicy, Session, StopReason, ThrottlePolicy, ToolLoopConfig,
    FINALIZE_NOTE,
};
use triage_providers::{GenerateOptions, ModelClient, ProviderError};
use triage_tools::ToolExecutor;
use triage_types::{ChatMessage, ChatRole, ModelResponse, ProviderInfo, ToolInvocation, ToolSchema};

struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelResponse, ProviderError>>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, GenerateOptions)>>,
}

impl ScriptedModel {
    fn new(replies: Vec<ModelResponse>) -> Arc<Self> {
        Self::with_results(replies.into_iter().map(Ok).collect())
    }

    fn with_results(replies: Vec<Result<ModelResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: Vec::new(),
        }
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ProviderError> {
        self.requests
            .lock()
            .push((messages.to_vec(), options.clone()));
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::fatal("script exhausted")))
    }
}

/// Records every execution. `delay_ms` in the arguments delays the reply and
/// `big` makes the tool emit a large table.
#[derive(Default)]
struct CountingTools {
    executed: Mutex<Vec<(String, Value)>>,
}

impl CountingTools {
    fn count(&self) -> usize {
        self.executed.lock().len()
    }
}

#[async_trait]
impl ToolExecutor for CountingTools {
    async fn schemas(&self) -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "get_pods".to_string(),
            description: "List pods in a namespace".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"namespace": {"type": "string"}}
            }),
        }]
    }

    async fn execute(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        self.executed.lock().push((name.to_string(), args.clone()));
        if let Some(delay) = args.get("delay_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        if name == "flaky" {
            anyhow::bail!("the server could not find the requested resource");
        }
        if args.get("big").and_then(Value::as_bool).unwrap_or(false) {
            return Ok((0..200)
                .map(|i| format!("pod-{i:03}  1/1  Running  0  3d  10.1.{i}.7  worker-{}", i % 7))
                .collect::<Vec<_>>()
                .join("\n"));
        }
        let tag = args
            .get("tag")
            .and_then(Value::as_str)
            .or_else(|| args.get("namespace").and_then(Value::as_str))
            .unwrap_or("none");
        Ok(format!("{name}[{tag}]: web-1 Running"))
    }
}

fn calls(specs: &[(&str, &str)]) -> ModelResponse {
    ModelResponse::with_tool_calls(
        None,
        specs
            .iter()
            .map(|(name, args)| ToolInvocation::new("", *name, *args))
            .collect(),
    )
}

fn build(
    model: Arc<ScriptedModel>,
    tools: Arc<CountingTools>,
    config: ToolLoopConfig,
    dir: &Path,
    threshold_chars: usize,
) -> Orchestrator {
    let requests = RequestEngine::new(
        model,
        Arc::new(RateLimiter::new(ThrottlePolicy::Disabled)),
        RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        },
    );
    Orchestrator::new(
        requests,
        tools,
        ArtifactStore::new(ArtifactSettings {
            threshold_chars,
            preview_max_lines: 5,
            preview_max_cols: 60,
            dir: dir.to_path_buf(),
        }),
        config,
        GenerateOptions::default(),
    )
}

fn question() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You diagnose Kubernetes workloads."),
        ChatMessage::user("Why is checkout returning 502s?"),
    ]
}

#[tokio::test]
async fn duplicate_calls_in_one_round_execute_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![
        calls(&[
            ("get_pods", r#"{"namespace":"default"}"#),
            ("get_pods", r#"{"namespace":"default"}"#),
        ]),
        ModelResponse::text("web-1 is running; the 502s come from the ingress."),
    ]);
    let tools = Arc::new(CountingTools::default());
    let orch = build(model, tools.clone(), ToolLoopConfig::default(), dir.path(), 10_000);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");

    assert_eq!(tools.count(), 1);
    assert_eq!(outcome.tool_calls.len(), 2);
    assert_eq!(outcome.tool_calls[0].result, outcome.tool_calls[1].result);
    assert!(!outcome.tool_calls[0].cache_hit);
    assert!(outcome.tool_calls[1].cache_hit);
    assert_eq!(outcome.metrics.total_tool_calls, 2);
    assert_eq!(outcome.metrics.repeated_calls, 1);
    assert!(outcome.stop_reason.is_none());

    // Each tool-call id in the assistant message has exactly one result message.
    let assistant = outcome
        .messages
        .iter()
        .find(|m| m.role == ChatRole::Assistant && !m.tool_calls.is_empty())
        .expect("assistant tool-call message");
    let result_ids = outcome
        .messages
        .iter()
        .filter(|m| m.role == ChatRole::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect::<Vec<_>>();
    let call_ids = assistant
        .tool_calls
        .iter()
        .map(|c| c.id.clone())
        .collect::<Vec<_>>();
    assert_eq!(result_ids, call_ids);
}

#[tokio::test(start_paused = true)]
async fn results_follow_request_order_despite_completion_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![
        calls(&[
            ("describe", r#"{"tag":"slow","delay_ms":400}"#),
            ("describe", r#"{"tag":"fast","delay_ms":5}"#),
            ("describe", r#"{"tag":"medium","delay_ms":120}"#),
        ]),
        ModelResponse::text("done"),
    ]);
    let tools = Arc::new(CountingTools::default());
    let config = ToolLoopConfig {
        parallelism: 3,
        ..ToolLoopConfig::default()
    };
    let orch = build(model, tools.clone(), config, dir.path(), 10_000);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    let tags = outcome
        .tool_calls
        .iter()
        .map(|call| call.arguments["tag"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(tags, vec!["slow", "fast", "medium"]);
    assert!(outcome.tool_calls[0].result.contains("[slow]"));
    assert!(outcome.tool_calls[2].result.contains("[medium]"));
}

#[tokio::test]
async fn identical_plans_stall_the_loop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan = || calls(&[("get_pods", r#"{"namespace":"shop"}"#)]);
    let model = ScriptedModel::new(vec![
        plan(),
        plan(),
        plan(),
        ModelResponse::text("Pods look healthy; check the ingress."),
    ]);
    let tools = Arc::new(CountingTools::default());
    let config = ToolLoopConfig {
        stall_threshold: 3,
        max_repeat_per_signature: 0,
        no_progress_threshold: 0,
        ..ToolLoopConfig::default()
    };
    let orch = build(model.clone(), tools, config, dir.path(), 10_000);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    assert!(matches!(outcome.stop_reason, Some(StopReason::Stalled { repeats: 3 })));
    assert_eq!(outcome.answer, "Pods look healthy; check the ingress.");
    assert_eq!(outcome.metrics.tool_call_iterations, 2);
    assert_eq!(model.request_count(), 4);
}

#[tokio::test]
async fn repeat_limit_rejects_second_identical_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan = || calls(&[("get_pods", r#"{"namespace":"shop"}"#)]);
    let model = ScriptedModel::new(vec![plan(), plan(), ModelResponse::text("final")]);
    let tools = Arc::new(CountingTools::default());
    let config = ToolLoopConfig {
        max_repeat_per_signature: 1,
        no_progress_threshold: 0,
        ..ToolLoopConfig::default()
    };
    let orch = build(model, tools.clone(), config, dir.path(), 10_000);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    assert_eq!(tools.count(), 1);
    assert!(outcome.metrics.stop_reason.contains("repeat limit"));
    let tool_call_messages = outcome
        .messages
        .iter()
        .filter(|m| m.role == ChatRole::Assistant && !m.tool_calls.is_empty())
        .count();
    assert_eq!(tool_call_messages, 1);
}

#[tokio::test]
async fn oversized_results_are_persisted_as_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![
        calls(&[("get_pods", r#"{"namespace":"shop","big":true}"#)]),
        ModelResponse::text("200 pods, all running."),
    ]);
    let tools = Arc::new(CountingTools::default());
    let orch = build(model.clone(), tools, ToolLoopConfig::default(), dir.path(), 500);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    let record = &outcome.tool_calls[0];
    let path = record.artifact_path.as_deref().expect("artifact path");
    let hash = record.artifact_hash.as_deref().expect("artifact hash");

    let written = std::fs::read_to_string(path).expect("artifact file");
    let (_, body) = split_artifact(&written).expect("header");
    let raw = body.strip_suffix('\n').expect("newline terminated");
    assert_eq!(sha256_hex(raw.as_bytes()), hash);
    assert_eq!(raw.len(), record.raw_bytes);
    assert!(record.result.contains(path));
    assert!(record.result.starts_with(raw));

    let requests = model.requests.lock();
    let (messages, _) = requests.last().expect("follow-up request");
    let tool_message = messages
        .iter()
        .find(|m| m.role == ChatRole::Tool)
        .expect("tool message");
    assert!(tool_message.content.len() < raw.len());
    assert!(tool_message.content.contains(path));
}

#[tokio::test]
async fn iteration_cap_sends_a_single_finalization_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![
        calls(&[("get_pods", r#"{"namespace":"shop"}"#)]),
        calls(&[("get_events", r#"{"namespace":"shop"}"#)]),
        ModelResponse::text("The readiness probe is failing."),
    ]);
    let tools = Arc::new(CountingTools::default());
    let config = ToolLoopConfig {
        max_iterations: 1,
        ..ToolLoopConfig::default()
    };
    let orch = build(model.clone(), tools.clone(), config, dir.path(), 10_000);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    assert_eq!(tools.count(), 1);
    assert_eq!(outcome.stop_reason, Some(StopReason::IterationLimit { limit: 1 }));
    assert_eq!(outcome.answer, "The readiness probe is failing.");

    let requests = model.requests.lock();
    let finalization = requests
        .iter()
        .filter(|(messages, _)| {
            messages
                .iter()
                .any(|m| m.role == ChatRole::System && m.content.contains(FINALIZE_NOTE))
        })
        .collect::<Vec<_>>();
    assert_eq!(finalization.len(), 1);
    assert!(finalization[0].1.tools.is_empty());
    assert_eq!(requests.len(), 3);
}

fn finalization_requests(model: &ScriptedModel) -> Vec<GenerateOptions> {
    model
        .requests
        .lock()
        .iter()
        .filter(|(messages, _)| {
            messages
                .iter()
                .any(|m| m.role == ChatRole::System && m.content.contains(FINALIZE_NOTE))
        })
        .map(|(_, options)| options.clone())
        .collect()
}

#[tokio::test]
async fn returning_to_an_earlier_plan_is_a_cycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let shop = || calls(&[("get_pods", r#"{"namespace":"shop"}"#)]);
    let payments = || calls(&[("get_pods", r#"{"namespace":"payments"}"#)]);
    let model = ScriptedModel::new(vec![
        shop(),
        payments(),
        shop(),
        ModelResponse::text("Both namespaces are healthy; look at the load balancer."),
    ]);
    let tools = Arc::new(CountingTools::default());
    let config = ToolLoopConfig {
        cycle_threshold: 1,
        stall_threshold: 0,
        no_progress_threshold: 0,
        ..ToolLoopConfig::default()
    };
    let orch = build(model.clone(), tools.clone(), config, dir.path(), 10_000);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    assert_eq!(outcome.stop_reason, Some(StopReason::Cycle { occurrences: 2 }));
    assert_eq!(outcome.metrics.stop_reason, StopReason::Cycle { occurrences: 2 }.to_string());
    assert_eq!(tools.count(), 2);
    assert_eq!(outcome.metrics.tool_call_iterations, 2);
    assert_eq!(
        outcome.answer,
        "Both namespaces are healthy; look at the load balancer."
    );

    let finalization = finalization_requests(&model);
    assert_eq!(finalization.len(), 1);
    assert!(finalization[0].tools.is_empty());
    assert_eq!(model.request_count(), 4);
}

#[tokio::test]
async fn exhausted_call_budget_stops_before_executing_more_tools() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![
        calls(&[
            ("get_pods", r#"{"namespace":"a"}"#),
            ("get_pods", r#"{"namespace":"b"}"#),
        ]),
        calls(&[
            ("get_pods", r#"{"namespace":"c"}"#),
            ("get_pods", r#"{"namespace":"d"}"#),
        ]),
        calls(&[("get_pods", r#"{"namespace":"e"}"#)]),
        ModelResponse::text("Namespaces a to c are fine."),
    ]);
    let tools = Arc::new(CountingTools::default());
    let config = ToolLoopConfig {
        max_total_tool_calls: 3,
        ..ToolLoopConfig::default()
    };
    let orch = build(model.clone(), tools.clone(), config, dir.path(), 10_000);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    assert_eq!(outcome.stop_reason, Some(StopReason::ToolCallBudget { limit: 3 }));
    assert_eq!(tools.count(), 3);
    assert_eq!(outcome.metrics.total_tool_calls, 3);
    let executed = tools
        .executed
        .lock()
        .iter()
        .map(|(_, args)| args["namespace"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(executed, vec!["a", "b", "c"]);

    // The over-budget plan is never appended as an assistant tool-call message.
    let tool_call_messages = outcome
        .messages
        .iter()
        .filter(|m| m.role == ChatRole::Assistant && !m.tool_calls.is_empty())
        .map(|m| m.tool_calls.len())
        .collect::<Vec<_>>();
    assert_eq!(tool_call_messages, vec![2, 1]);
    assert_eq!(finalization_requests(&model).len(), 1);
    assert_eq!(model.request_count(), 4);
}

#[tokio::test]
async fn repeated_evidence_ends_the_loop_without_progress() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan = || calls(&[("get_pods", r#"{"namespace":"shop"}"#)]);
    let model = ScriptedModel::new(vec![plan(), plan(), ModelResponse::text("nothing new")]);
    let config = ToolLoopConfig {
        no_progress_threshold: 1,
        stall_threshold: 0,
        max_repeat_per_signature: 0,
        ..ToolLoopConfig::default()
    };
    let orch = build(model, Arc::new(CountingTools::default()), config, dir.path(), 10_000);

    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    assert_eq!(outcome.stop_reason, Some(StopReason::NoProgress { rounds: 1 }));
    assert_eq!(outcome.metrics.cache_hits, 1);
}

#[tokio::test]
async fn tool_failures_are_fed_back_to_the_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![
        calls(&[("flaky", r#"{"resource":"ingress"}"#)]),
        ModelResponse::text("The ingress resource does not exist."),
    ]);
    let orch = build(
        model.clone(),
        Arc::new(CountingTools::default()),
        ToolLoopConfig::default(),
        dir.path(),
        10_000,
    );
    let outcome = orch
        .run_turn(question(), &CancellationToken::new())
        .await
        .expect("turn");
    assert!(outcome.tool_calls[0]
        .result
        .contains("could not find the requested resource"));
    assert_eq!(outcome.answer, "The ingress resource does not exist.");
}

#[tokio::test(start_paused = true)]
async fn rate_limit_then_success_makes_two_calls() {
    let model = ScriptedModel::with_results(vec![
        Err(ProviderError::rate_limited("429 Too Many Requests")),
        Ok(ModelResponse::text("recovered")),
    ]);
    let engine = RequestEngine::new(
        model.clone(),
        Arc::new(RateLimiter::new(ThrottlePolicy::Disabled)),
        RetryPolicy::default(),
    );
    let response = engine
        .generate(
            &question(),
            &GenerateOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("response");
    assert_eq!(model.request_count(), 2);
    assert_eq!(response.content(), "recovered");
}

#[tokio::test]
async fn cancellation_mid_tool_leaves_session_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![
        calls(&[("get_logs", r#"{"tag":"web","delay_ms":60000}"#)]),
        ModelResponse::text("unreachable"),
    ]);
    let orch = build(
        model,
        Arc::new(CountingTools::default()),
        ToolLoopConfig::default(),
        dir.path(),
        10_000,
    );
    let mut session = Session::new(Some("You diagnose Kubernetes workloads."));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = orch
        .run_session_turn(&mut session, "tail the web logs", &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, EngineError::Cancelled));
    assert!(session.events().is_empty());
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn session_turns_accumulate_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![
        calls(&[("get_pods", r#"{"namespace":"shop"}"#)]),
        ModelResponse::text("web-1 is running."),
        ModelResponse::text("No restarts in the last hour."),
    ]);
    let orch = build(
        model.clone(),
        Arc::new(CountingTools::default()),
        ToolLoopConfig::default(),
        dir.path(),
        10_000,
    );
    let mut session = Session::new(None);
    let cancel = CancellationToken::new();
    orch.run_session_turn(&mut session, "is web up?", &cancel)
        .await
        .expect("first turn");
    orch.run_session_turn(&mut session, "any restarts?", &cancel)
        .await
        .expect("second turn");

    assert_eq!(session.events().len(), 2);
    assert_eq!(session.events()[0].tool_calls.len(), 1);
    assert!(session.events()[1].tool_calls.is_empty());
    let requests = model.requests.lock();
    let (last_messages, options) = requests.last().expect("second turn request");
    assert!(last_messages
        .iter()
        .any(|m| m.role == ChatRole::Assistant && m.content == "web-1 is running."));
    assert_eq!(options.tools.len(), 1);
}
