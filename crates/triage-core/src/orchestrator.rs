use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use triage_observability::{emit_event, ObservabilityEvent, ProcessKind};
use triage_providers::{GenerateOptions, ToolChoice};
use triage_tools::{validate_tool_schemas, ToolExecutor};
use triage_types::{ChatMessage, EngineEvent, ModelResponse, ToolCallData};

use crate::{
    assign_call_ids, evidence_hash, plan_fingerprint, prepare_calls, preview, transcript_view,
    ArtifactCache, ArtifactStore, EngineError, EventBus, ExecutedCall, LoopBudgetState,
    LoopMetrics, ParallelExecutor, PreparedBatch, PreparedCall, RequestEngine, ResultCache,
    StopReason, ToolLoopConfig,
};

/// Appended before the tool-free finalization request.
pub const FINALIZE_NOTE: &str = "Do not request additional tool calls.";

#[derive(Debug, Clone, PartialEq)]
pub enum TurnState {
    Plan,
    ExecuteTools(PreparedBatch),
    Integrate(Vec<ExecutedCall>),
    Finalize,
    Done,
}

impl TurnState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::ExecuteTools(_) => "execute_tools",
            Self::Integrate(_) => "integrate",
            Self::Finalize => "finalize",
            Self::Done => "done",
        }
    }
}

/// Tracks prose already shown to the user so it is not repeated on a later round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayState {
    pub content_shown: bool,
    pub shown_text: String,
}

/// Mutable state of one user turn.
pub struct TurnContext {
    pub turn_id: String,
    pub messages: Vec<ChatMessage>,
    pub response: ModelResponse,
    pub budget: LoopBudgetState,
    pub results: ResultCache,
    pub artifacts: ArtifactCache,
    pub tool_calls: Vec<ToolCallData>,
    pub display: DisplayState,
    pub round: usize,
    pub options: GenerateOptions,
    pub cancel: CancellationToken,
}

impl TurnContext {
    pub fn new(
        messages: Vec<ChatMessage>,
        response: ModelResponse,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            messages,
            response,
            budget: LoopBudgetState::new(),
            results: ResultCache::new(),
            artifacts: ArtifactCache::default(),
            tool_calls: Vec::new(),
            display: DisplayState::default(),
            round: 0,
            options,
            cancel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub answer: String,
    pub response: ModelResponse,
    pub tool_calls: Vec<ToolCallData>,
    /// Full conversation after the turn, ending with the assistant answer.
    pub messages: Vec<ChatMessage>,
    pub display: DisplayState,
    pub stop_reason: Option<StopReason>,
    pub metrics: LoopMetrics,
}

impl TurnOutcome {
    pub fn answer_already_shown(&self) -> bool {
        self.display.content_shown && self.display.shown_text == self.answer.trim()
    }
}

/// Drives one user turn through plan → execute → integrate rounds until the
/// model stops asking for tools or a budget forces finalization.
pub struct Orchestrator {
    requests: RequestEngine,
    executor: ParallelExecutor,
    artifacts: ArtifactStore,
    config: ToolLoopConfig,
    options: GenerateOptions,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(
        requests: RequestEngine,
        tools: Arc<dyn ToolExecutor>,
        artifacts: ArtifactStore,
        config: ToolLoopConfig,
        options: GenerateOptions,
    ) -> Self {
        let executor = ParallelExecutor::new(tools, config.execution_settings());
        Self {
            requests,
            executor,
            artifacts,
            config,
            options,
            events: EventBus::new(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &ToolLoopConfig {
        &self.config
    }

    /// Generation options advertising every registered tool.
    pub async fn tool_options(&self) -> Result<GenerateOptions, EngineError> {
        let schemas = self.executor.tools().schemas().await;
        validate_tool_schemas(&schemas)?;
        Ok(GenerateOptions {
            tools: schemas,
            tool_choice: ToolChoice::Auto,
            ..self.options.clone()
        })
    }

    pub async fn run_turn(
        &self,
        messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let options = self.tool_options().await?;
        let response = self.requests.generate(&messages, &options, cancel).await?;
        self.drive(TurnContext::new(messages, response, options, cancel.clone()))
            .await
    }

    /// Runs the state machine from `Plan` on an already obtained response.
    pub async fn drive(&self, mut turn: TurnContext) -> Result<TurnOutcome, EngineError> {
        let mut state = TurnState::Plan;
        while !matches!(state, TurnState::Done) {
            state = self.step(&mut turn, state).await?;
        }
        Ok(self.finish(turn))
    }

    pub async fn step(
        &self,
        turn: &mut TurnContext,
        state: TurnState,
    ) -> Result<TurnState, EngineError> {
        if turn.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        tracing::trace!(
            turn_id = %turn.turn_id,
            round = turn.round,
            state = state.name(),
            "turn step"
        );
        match state {
            TurnState::Plan => Ok(self.plan(turn)),
            TurnState::ExecuteTools(batch) => self.execute_tools(turn, batch).await,
            TurnState::Integrate(executed) => self.integrate(turn, executed).await,
            TurnState::Finalize => self.finalize(turn).await,
            TurnState::Done => Ok(TurnState::Done),
        }
    }

    fn plan(&self, turn: &mut TurnContext) -> TurnState {
        let mut calls = turn.response.tool_calls();
        if calls.is_empty() {
            return TurnState::Done;
        }
        let content = turn.response.content();
        self.show_prose(turn, &content);

        let cfg = &self.config;
        if turn.budget.tool_call_iterations >= cfg.max_iterations {
            return self.stop(
                turn,
                StopReason::IterationLimit {
                    limit: cfg.max_iterations,
                },
            );
        }
        let observation = turn.budget.observe_plan(&plan_fingerprint(&calls));
        if observation.is_stall(cfg.stall_threshold) {
            return self.stop(
                turn,
                StopReason::Stalled {
                    repeats: observation.consecutive_repeats,
                },
            );
        }
        if observation.is_cycle(cfg.cycle_threshold) {
            return self.stop(
                turn,
                StopReason::Cycle {
                    occurrences: observation.prior_occurrences + 1,
                },
            );
        }
        let remaining = turn.budget.remaining_tool_calls(cfg.max_total_tool_calls);
        if remaining == 0 {
            return self.stop(
                turn,
                StopReason::ToolCallBudget {
                    limit: cfg.max_total_tool_calls,
                },
            );
        }
        if calls.len() > remaining {
            tracing::info!(
                turn_id = %turn.turn_id,
                requested = calls.len(),
                remaining,
                "truncating tool batch to remaining call budget"
            );
            calls.truncate(remaining);
        }

        assign_call_ids(&mut calls, Utc::now());
        let batch = prepare_calls(&calls, &turn.budget, &cfg.prepare_limits(), turn.round);
        if let Some(reason) = batch.stop_reason.clone() {
            return self.stop(turn, reason);
        }
        turn.budget.commit_batch(&batch);
        turn.messages.push(ChatMessage::assistant_with_tools(content, calls));
        TurnState::ExecuteTools(batch)
    }

    async fn execute_tools(
        &self,
        turn: &mut TurnContext,
        batch: PreparedBatch,
    ) -> Result<TurnState, EngineError> {
        turn.budget.tool_call_iterations += 1;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "tool.batch.start",
                component: "orchestrator",
                turn_id: Some(turn.turn_id.as_str()),
                round: Some(turn.round),
                status: Some("start"),
                detail: Some(&format!(
                    "calls={} unique={}",
                    batch.len(),
                    batch.leaders().len()
                )),
                ..Default::default()
            },
        );
        for call in &batch.calls {
            self.publish_tool_event(turn, "tool.started", call, None);
        }
        let started = tokio::time::Instant::now();
        let executed = self
            .executor
            .execute_batch(&batch, &turn.results, &turn.cancel)
            .await?;
        let failures = executed.iter().filter(|call| call.is_error()).count();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "tool.batch.finish",
                component: "orchestrator",
                turn_id: Some(turn.turn_id.as_str()),
                round: Some(turn.round),
                status: Some(if failures == 0 { "ok" } else { "partial" }),
                elapsed_ms: Some(started.elapsed().as_millis() as u64),
                detail: Some(&format!("calls={} failed={failures}", executed.len())),
                ..Default::default()
            },
        );
        Ok(TurnState::Integrate(executed))
    }

    async fn integrate(
        &self,
        turn: &mut TurnContext,
        executed: Vec<ExecutedCall>,
    ) -> Result<TurnState, EngineError> {
        let mut evidence = Vec::with_capacity(executed.len());
        for call in executed {
            turn.budget.total_tool_calls += 1;
            turn.budget.total_result_bytes += call.result.len();
            if call.cache_hit {
                turn.budget.cache_hits += 1;
            }

            let (call, model_text, transcript_text) = self.compact(turn, call).await;
            let finished = if call.is_error() {
                "tool.failed"
            } else {
                "tool.completed"
            };
            self.publish_tool_event(turn, finished, &call.prepared, Some(&call));

            turn.messages.push(ChatMessage::tool_result(
                call.prepared.id(),
                call.prepared.name(),
                model_text,
            ));
            evidence.push(evidence_hash(
                call.prepared.name(),
                &call.prepared.arguments,
                &call.result,
            ));
            turn.tool_calls.push(ToolCallData {
                name: call.prepared.name().to_string(),
                arguments: call.prepared.arguments.clone(),
                result: transcript_text,
                raw_bytes: call.result.len(),
                artifact_path: call
                    .artifact
                    .as_ref()
                    .map(|artifact| artifact.path.display().to_string()),
                artifact_hash: call.artifact.as_ref().map(|artifact| artifact.hash.clone()),
                cache_hit: call.cache_hit,
            });
        }

        let found_new = turn.budget.record_evidence(evidence);
        let threshold = self.config.no_progress_threshold;
        if !found_new && threshold > 0 && turn.budget.no_progress_rounds >= threshold {
            let rounds = turn.budget.no_progress_rounds;
            self.stop(turn, StopReason::NoProgress { rounds });
        }
        if turn.budget.is_stopped() {
            return Ok(TurnState::Finalize);
        }

        turn.response = self
            .requests
            .generate(&turn.messages, &turn.options, &turn.cancel)
            .await?;
        turn.round += 1;
        Ok(TurnState::Plan)
    }

    /// Splits a result into the model-visible and transcript-visible texts,
    /// persisting oversized output.
    async fn compact(
        &self,
        turn: &mut TurnContext,
        call: ExecutedCall,
    ) -> (ExecutedCall, String, String) {
        if !self.artifacts.exceeds_threshold(&call.result) {
            let text = call.result.clone();
            return (call, text.clone(), text);
        }
        let resolved = self
            .artifacts
            .resolve(
                &mut turn.artifacts,
                call.prepared.name(),
                call.prepared.signature.as_deref(),
                &call.result,
            )
            .await;
        match resolved {
            Ok(artifact) => {
                let model_text = self.artifacts.model_view(&call.result, &artifact);
                let transcript = transcript_view(&call.result, &artifact);
                (call.with_artifact(artifact), model_text, transcript)
            }
            Err(err) => {
                tracing::warn!(
                    tool = call.prepared.name(),
                    error = %err,
                    "failed to persist tool output"
                );
                let settings = self.artifacts.settings();
                let model_text = format!(
                    "{}\n\n[output truncated; saving the full result failed: {err}]",
                    preview(&call.result, settings.preview_max_lines, settings.preview_max_cols)
                );
                let transcript = call.result.clone();
                (call, model_text, transcript)
            }
        }
    }

    async fn finalize(&self, turn: &mut TurnContext) -> Result<TurnState, EngineError> {
        let reason = turn
            .budget
            .stop_reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "the tool loop was stopped".to_string());
        turn.messages.push(ChatMessage::system(format!(
            "Tool use for this turn has ended: {reason}. Answer the user's question now using \
             only the tool results already gathered above. {FINALIZE_NOTE}"
        )));
        let options = turn.options.without_tools();
        let response = self
            .requests
            .generate(&turn.messages, &options, &turn.cancel)
            .await?;
        let answer = response.content();
        turn.response = if answer.trim().is_empty() {
            ModelResponse::text(fallback_answer(&reason, &turn.tool_calls))
        } else {
            ModelResponse {
                choices: vec![triage_types::ModelChoice {
                    content: Some(answer),
                    tool_calls: Vec::new(),
                }],
                usage: response.usage,
            }
        };
        Ok(TurnState::Done)
    }

    fn finish(&self, mut turn: TurnContext) -> TurnOutcome {
        let answer = turn.response.content();
        if !answer.trim().is_empty() {
            turn.messages.push(ChatMessage::assistant(answer.clone()));
        }
        let metrics = turn.budget.metrics();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.finish",
                component: "orchestrator",
                turn_id: Some(turn.turn_id.as_str()),
                round: Some(turn.round),
                status: Some(if turn.budget.is_stopped() {
                    "stopped"
                } else {
                    "completed"
                }),
                detail: Some(&serde_json::to_string(&metrics).unwrap_or_default()),
                ..Default::default()
            },
        );
        TurnOutcome {
            answer,
            response: turn.response,
            tool_calls: turn.tool_calls,
            messages: turn.messages,
            display: turn.display,
            stop_reason: turn.budget.stop_reason,
            metrics,
        }
    }

    fn stop(&self, turn: &mut TurnContext, reason: StopReason) -> TurnState {
        let code = reason.code();
        let text = reason.to_string();
        if turn.budget.set_stop(reason) {
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "loop.stop",
                    component: "orchestrator",
                    turn_id: Some(turn.turn_id.as_str()),
                    round: Some(turn.round),
                    status: Some(code),
                    detail: Some(text.as_str()),
                    ..Default::default()
                },
            );
            self.events.publish(EngineEvent::new(
                "loop.stopped",
                json!({ "turnId": turn.turn_id, "reason": code, "message": text }),
            ));
        }
        TurnState::Finalize
    }

    fn show_prose(&self, turn: &mut TurnContext, content: &str) {
        let text = content.trim();
        if text.is_empty() {
            return;
        }
        if turn.display.content_shown && turn.display.shown_text == text {
            return;
        }
        turn.display = DisplayState {
            content_shown: true,
            shown_text: text.to_string(),
        };
        self.events.publish(EngineEvent::new(
            "message.prose",
            json!({ "turnId": turn.turn_id, "round": turn.round, "text": text }),
        ));
    }

    fn publish_tool_event(
        &self,
        turn: &TurnContext,
        event_type: &str,
        prepared: &PreparedCall,
        executed: Option<&ExecutedCall>,
    ) {
        let mut properties = json!({
            "turnId": turn.turn_id,
            "round": turn.round,
            "callId": prepared.id(),
            "tool": prepared.name(),
            "args": prepared.arguments,
        });
        if let Some(call) = executed {
            properties["cacheHit"] = json!(call.cache_hit);
            properties["bytes"] = json!(call.result.len());
            if let Some(error) = call.error.as_ref() {
                properties["error"] = json!(error);
            }
            if let Some(path) = call.artifact_path() {
                properties["artifactPath"] = json!(path.display().to_string());
            }
        }
        self.events.publish(EngineEvent::new(event_type, properties));
    }
}

fn fallback_answer(reason: &str, tool_calls: &[ToolCallData]) -> String {
    let mut out = format!(
        "I stopped running diagnostic tools because the loop {reason}, and no final answer \
         was produced."
    );
    if let Some(last) = tool_calls.last() {
        out.push_str(&format!(
            "\n\nMost recent result from `{}`:\n{}",
            last.name,
            truncate_text(&last.result, 600)
        ));
    }
    out
}

fn truncate_text(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = input[..end].to_string();
    out.push_str("...<truncated>");
    out
}
