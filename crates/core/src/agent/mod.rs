//! Reason-act loop: drives the LLM through interleaved tool use, streams
//! events to the caller, and records task and tool-call rows as it goes.
//!
//! The stream is a push channel — a producer task sends [`AgentEvent`]s
//! and the consumer drains the receiver. Cancellation closes the run
//! between steps, never mid-write. Event order within a run matches
//! `(thinking|text|tool_call+ tool_result+ (stuck_warning)?)* (done|error)`.

use anima_llm::provider::{
    ChatMessage, CompletionRequest, ContentBlock, LlmError, LlmProvider, Role,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::executor::{self, ToolCallSpec};
use crate::ratelimit::{TokenBucket, UsageTracker};
use crate::store::{conversation, tasks, Store};
use crate::stuck::StuckDetector;
use crate::tools::{ToolContext, ToolRegistry, ToolResult};
use crate::context;
use crate::types::{ChatRole, TaskStatus};

/// Cap on stored task results and conversation rows.
const STORED_RESULT_CAP: usize = 4000;
/// LLM retry ceiling per iteration.
const LLM_MAX_ATTEMPTS: u32 = 5;
const API_LABEL: &str = "llm";

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Thinking(String),
    Text(String),
    ToolCall { name: String, args: serde_json::Value },
    ToolResult { name: String, result: ToolResult },
    StuckWarning(String),
    Error(String),
    Done(String),
}

impl AgentEvent {
    /// Terminal events end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }
}

#[derive(Debug, Clone)]
pub struct ImageInput {
    pub media_type: String,
    pub data: String,
}

#[derive(Clone)]
pub struct RunOptions {
    pub session_id: String,
    pub images: Vec<ImageInput>,
    /// Override for the configured iteration ceiling.
    pub max_iterations: Option<u32>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            images: vec![],
            max_iterations: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// One configured agent loop, cheap to clone per run.
#[derive(Clone)]
pub struct AgentLoop {
    store: Store,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    limiter: TokenBucket,
    usage: UsageTracker,
    workspace: PathBuf,
}

impl AgentLoop {
    pub fn new(
        store: Store,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        limiter: TokenBucket,
        usage: UsageTracker,
        workspace: PathBuf,
    ) -> Self {
        Self { store, registry, provider, limiter, usage, workspace }
    }

    /// Start one run. Returns the event stream; the producer task owns the
    /// run and always ends the stream with `done` or `error`.
    pub fn run(&self, user_message: String, opts: RunOptions) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            let task_id = match this.store.task_create(&opts.session_id, &user_message).await {
                Ok(task) => task.id,
                Err(e) => {
                    let _ = tx.send(AgentEvent::Error(format!("failed to start run: {e}"))).await;
                    return;
                }
            };

            match this.drive(task_id, &user_message, &opts, &tx).await {
                Ok(()) => {}
                Err(e) => {
                    // Terminal bookkeeping for unexpected faults; normal
                    // completions, stuck and cancellation are handled inside.
                    let message = e.to_string();
                    let _ = this
                        .store
                        .task_finish(task_id, TaskStatus::Failed, Some(&truncate(&message, STORED_RESULT_CAP)))
                        .await;
                    let _ = tx.send(AgentEvent::Error(message)).await;
                }
            }
        });
        rx
    }

    async fn drive(
        &self,
        task_id: uuid::Uuid,
        user_message: &str,
        opts: &RunOptions,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let pool = self.store.pool();
        let config = AgentConfig::load(pool).await?;
        let ctx = ToolContext::new(config.clone(), self.store.clone(), self.workspace.clone());

        let declarations = self.registry.declarations();
        let system_prompt =
            context::assemble(pool, &declarations, user_message, &opts.session_id).await?;

        // Replay persisted history, then the fresh user turn.
        let mut messages: Vec<ChatMessage> =
            conversation::history(pool, &opts.session_id, 50)
                .await?
                .into_iter()
                .map(|row| match row.role {
                    ChatRole::User => ChatMessage::user_text(row.content),
                    ChatRole::Model => ChatMessage::assistant_text(row.content),
                })
                .collect();
        messages.push(user_turn(user_message, &opts.images));

        let max_iterations = opts.max_iterations.unwrap_or(config.max_iterations);
        let mut detector = StuckDetector::new(max_iterations);

        loop {
            if opts.cancel.is_cancelled() {
                let reason = "cancelled by caller or shutdown";
                self.store
                    .task_finish(task_id, TaskStatus::Failed, Some(reason))
                    .await?;
                let _ = tx.send(AgentEvent::Done(format!("stopped: {reason}"))).await;
                return Ok(());
            }

            tasks::bump_iterations(pool, task_id).await?;

            let request = CompletionRequest {
                messages: messages.clone(),
                system: Some(system_prompt.clone()),
                max_tokens: 4096,
                temperature: config.temperature,
                thinking_budget: (config.thinking_budget > 0).then_some(config.thinking_budget),
                tools: declarations.clone(),
            };
            let response = self.call_llm(request, &opts.cancel).await?;

            if let Some(thinking) = &response.thinking {
                let _ = tx.send(AgentEvent::Thinking(thinking.clone())).await;
            }
            if !response.content.is_empty() {
                let _ = tx.send(AgentEvent::Text(response.content.clone())).await;
            }

            let tool_calls = response.tool_calls();
            if tool_calls.is_empty() {
                let final_text = response.content;
                self.store
                    .task_finish(
                        task_id,
                        TaskStatus::Completed,
                        Some(&truncate(&final_text, STORED_RESULT_CAP)),
                    )
                    .await?;
                conversation::append(
                    pool,
                    &opts.session_id,
                    ChatRole::User,
                    &truncate(user_message, STORED_RESULT_CAP),
                )
                .await?;
                conversation::append(
                    pool,
                    &opts.session_id,
                    ChatRole::Model,
                    &truncate(&final_text, STORED_RESULT_CAP),
                )
                .await?;
                let _ = tx.send(AgentEvent::Done(final_text)).await;
                return Ok(());
            }

            // The model asked for tools: echo its turn, announce the calls,
            // feed the detector, then execute the whole batch in order.
            messages.push(ChatMessage::from_content_blocks(
                Role::Assistant,
                response.content_blocks.clone(),
            ));
            let mut specs = Vec::with_capacity(tool_calls.len());
            for call in &tool_calls {
                let _ = tx
                    .send(AgentEvent::ToolCall { name: call.name.clone(), args: call.args.clone() })
                    .await;
                detector.record(&call.name, &call.args.to_string());
                specs.push(ToolCallSpec { name: call.name.clone(), args: call.args.clone() });
            }

            let executed = executor::execute_batch(&self.registry, &ctx, specs, None).await;

            let mut result_blocks: Vec<ContentBlock> = Vec::with_capacity(executed.len());
            for (call, done) in tool_calls.iter().zip(executed.iter()) {
                let _ = tx
                    .send(AgentEvent::ToolResult {
                        name: done.name.clone(),
                        result: done.response.clone(),
                    })
                    .await;

                tasks::log_tool_call(
                    pool,
                    task_id,
                    &done.name,
                    &call.args.to_string(),
                    &loggable_output(&done.response),
                    done.response.success,
                    done.response.execution_time_ms as i64,
                )
                .await?;

                let content = if done.response.success {
                    done.response.output.clone()
                } else {
                    done.response
                        .error
                        .clone()
                        .unwrap_or_else(|| "tool failed with no message".into())
                };
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content,
                    is_error: !done.response.success,
                });
                // Screenshots and other images ride back to the model as
                // image blocks in the same synthetic user turn.
                for image in &done.response.images {
                    result_blocks.push(ContentBlock::Image {
                        media_type: image.media_type.clone(),
                        data: image.data.clone(),
                    });
                }
            }
            messages.push(ChatMessage::tool_results(result_blocks));

            let verdict = detector.check();
            if verdict.should_terminate {
                let message =
                    verdict.message.unwrap_or_else(|| "stuck detector fired".to_string());
                self.store.task_finish(task_id, TaskStatus::Stuck, Some(&message)).await?;
                let _ = tx.send(AgentEvent::StuckWarning(message.clone())).await;
                let _ = tx.send(AgentEvent::Error(format!("run terminated: {message}"))).await;
                return Ok(());
            }
            if verdict.is_stuck {
                let message = verdict.message.unwrap_or_else(|| "repetition detected".to_string());
                let _ = tx.send(AgentEvent::StuckWarning(message.clone())).await;
                messages.push(ChatMessage::user_text(format!("[system warning] {message}")));
            }
        }
    }

    /// One rate-limited LLM call with retry on retryable errors.
    async fn call_llm(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<anima_llm::provider::CompletionResponse> {
        let estimate = estimate_tokens(&request);

        let mut attempt = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AgentError::Cancelled("cancelled while waiting for rate limit".into()));
                }
                _ = self.limiter.acquire(estimate) => {}
            }

            match self.provider.complete(request.clone()).await {
                Ok(response) => {
                    self.usage
                        .record_request(API_LABEL, response.usage.total() as u64)
                        .await;
                    return Ok(response);
                }
                Err(e) => {
                    self.usage.record_error(API_LABEL).await;
                    attempt += 1;
                    if !e.is_retryable() || attempt >= LLM_MAX_ATTEMPTS {
                        return Err(e.into());
                    }
                    let wait = match &e {
                        LlmError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(*retry_after_ms)
                        }
                        _ => {
                            // Capped exponential backoff with jitter.
                            let base = Duration::from_millis(500 * 2u64.pow(attempt.min(6)));
                            let jitter = Duration::from_millis(rand::random::<u64>() % 250);
                            (base + jitter).min(Duration::from_secs(30))
                        }
                    };
                    tracing::warn!(error = %e, attempt, wait_ms = wait.as_millis() as u64, "LLM call failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(AgentError::Cancelled("cancelled during LLM retry backoff".into()));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

fn user_turn(text: &str, images: &[ImageInput]) -> ChatMessage {
    if images.is_empty() {
        return ChatMessage::user_text(text);
    }
    let mut blocks: Vec<ContentBlock> = images
        .iter()
        .map(|img| ContentBlock::Image {
            media_type: img.media_type.clone(),
            data: img.data.clone(),
        })
        .collect();
    blocks.push(ContentBlock::Text { text: text.to_string() });
    ChatMessage::from_content_blocks(Role::User, blocks)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Log form of a result: image payloads are replaced by short placeholders.
fn loggable_output(result: &ToolResult) -> String {
    let mut output = if result.success {
        result.output.clone()
    } else {
        format!(
            "{} | error: {}",
            result.output,
            result.error.as_deref().unwrap_or("unknown")
        )
    };
    for image in &result.images {
        output.push_str(&format!(" [image {} omitted]", image.id));
    }
    truncate(&output, STORED_RESULT_CAP)
}

/// Rough request size for the token bucket: characters / 4.
fn estimate_tokens(request: &CompletionRequest) -> u64 {
    let chars: usize = request.messages.iter().map(|m| m.content.len()).sum::<usize>()
        + request.system.as_deref().map(str::len).unwrap_or(0);
    (chars / 4) as u64 + 256
}

/// Drain a run's stream into a vector (test and driver helper).
pub async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_llm::provider::{CompletionResponse, ScriptedProvider, StopReason};

    async fn harness(provider: Arc<dyn LlmProvider>) -> (AgentLoop, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let workspace =
            std::env::temp_dir().join(format!("anima-agent-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&workspace).unwrap();
        let browser = Arc::new(crate::tools::browser::BrowserHost::new(Default::default()));
        let agent = AgentLoop::new(
            store.clone(),
            Arc::new(ToolRegistry::with_builtins(browser)),
            provider,
            TokenBucket::new(1_000_000, Duration::from_secs(60), 1_000_000),
            UsageTracker::new(),
            workspace,
        );
        (agent, store)
    }

    fn tool_use_response(name: &str, args: serde_json::Value) -> CompletionResponse {
        CompletionResponse {
            content: String::new(),
            thinking: None,
            content_blocks: vec![ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: name.into(),
                input: args,
            }],
            stop_reason: StopReason::ToolUse,
            usage: Default::default(),
        }
    }

    #[tokio::test]
    async fn plain_answer_completes_task_and_persists_conversation() {
        let provider = Arc::new(ScriptedProvider::new(vec![CompletionResponse::text(
            "the answer is 4",
        )]));
        let (agent, store) = harness(provider).await;

        let rx = agent.run("what is 2+2".into(), RunOptions::for_session("s1"));
        let events = collect_events(rx).await;

        assert!(matches!(events.last(), Some(AgentEvent::Done(text)) if text == "the answer is 4"));

        let recent = tasks::recent_for_session(store.pool(), "s1", 1).await.unwrap();
        assert_eq!(recent[0].status, TaskStatus::Completed);
        assert_eq!(recent[0].iterations, 1);

        let history = conversation::history(store.pool(), "s1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[1].role, ChatRole::Model);
    }

    #[tokio::test]
    async fn tool_call_round_trip_emits_paired_events() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_use_response("shell", serde_json::json!({"command": "echo hi"})),
            CompletionResponse::text("done: hi"),
        ]));
        let (agent, store) = harness(provider).await;

        let rx = agent.run("say hi via shell".into(), RunOptions::for_session("s1"));
        let events = collect_events(rx).await;

        let call_idx = events
            .iter()
            .position(|e| matches!(e, AgentEvent::ToolCall { name, .. } if name == "shell"))
            .expect("tool_call event");
        let result_idx = events
            .iter()
            .position(|e| matches!(e, AgentEvent::ToolResult { name, .. } if name == "shell"))
            .expect("tool_result event");
        assert!(call_idx < result_idx);
        assert!(matches!(events.last(), Some(AgentEvent::Done(_))));

        // The tool call was logged against the task.
        let task = &tasks::recent_for_session(store.pool(), "s1", 1).await.unwrap()[0];
        let calls = tasks::tool_calls_for_task(store.pool(), task.id).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].success);
    }

    #[tokio::test]
    async fn stuck_run_terminates_with_warning_then_error() {
        // The model always asks for the same shell call; iteration ceiling 6
        // lets the same-input warning fire first, then termination.
        let provider = Arc::new(ScriptedProvider::new(vec![tool_use_response(
            "shell",
            serde_json::json!({"command": "ls"}),
        )]));
        let (agent, store) = harness(provider).await;

        let mut opts = RunOptions::for_session("s1");
        opts.max_iterations = Some(6);
        let rx = agent.run("loop forever".into(), opts);
        let events = collect_events(rx).await;

        let warnings =
            events.iter().filter(|e| matches!(e, AgentEvent::StuckWarning(_))).count();
        assert!(warnings >= 1, "expected at least one stuck warning");
        assert!(matches!(events.last(), Some(AgentEvent::Error(_))));

        let task = &tasks::recent_for_session(store.pool(), "s1", 1).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Stuck);
        assert!(task.iterations <= 6);
    }

    #[tokio::test]
    async fn cancellation_ends_with_stopped_done() {
        let provider = Arc::new(ScriptedProvider::new(vec![tool_use_response(
            "wait",
            serde_json::json!({"seconds": 1}),
        )]));
        let (agent, store) = harness(provider).await;

        let opts = RunOptions::for_session("s1");
        let cancel = opts.cancel.clone();
        cancel.cancel(); // cancelled before the first iteration
        let rx = agent.run("never mind".into(), opts);
        let events = collect_events(rx).await;

        assert!(
            matches!(events.last(), Some(AgentEvent::Done(text)) if text.starts_with("stopped:"))
        );
        let task = &tasks::recent_for_session(store.pool(), "s1", 1).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn event_order_matches_grammar() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_use_response("shell", serde_json::json!({"command": "true"})),
            CompletionResponse::text("all good"),
        ]));
        let (agent, _store) = harness(provider).await;

        let rx = agent.run("check".into(), RunOptions::for_session("s1"));
        let events = collect_events(rx).await;

        // Terminal event exactly once, at the end.
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(events.last().unwrap().is_terminal());

        // Every tool_call has a matching tool_result before the stream ends.
        let calls = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolCall { .. }))
            .count();
        let results = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolResult { .. }))
            .count();
        assert_eq!(calls, results);
    }

    #[tokio::test]
    async fn thinking_is_streamed_before_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![CompletionResponse {
            content: "final".into(),
            thinking: Some("mull it over".into()),
            content_blocks: vec![
                ContentBlock::Thinking { text: "mull it over".into() },
                ContentBlock::Text { text: "final".into() },
            ],
            stop_reason: StopReason::EndTurn,
            usage: Default::default(),
        }]));
        let (agent, _store) = harness(provider).await;

        let rx = agent.run("ponder".into(), RunOptions::for_session("s1"));
        let events = collect_events(rx).await;

        let thinking_idx =
            events.iter().position(|e| matches!(e, AgentEvent::Thinking(_))).unwrap();
        let text_idx = events.iter().position(|e| matches!(e, AgentEvent::Text(_))).unwrap();
        assert!(thinking_idx < text_idx);
    }
}
