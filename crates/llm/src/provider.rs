use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    /// Plain text content (convenience — concatenation of Text blocks).
    pub content: String,
    /// Structured content blocks (native tool use protocol).
    /// Empty means the message is plain text only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<ContentBlock>,
}

impl ChatMessage {
    /// Build a message from structured content blocks.
    pub fn from_content_blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        let text: String = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        Self { role, content: text, content_blocks: blocks }
    }

    /// Plain user text message.
    pub fn user_text(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), content_blocks: vec![] }
    }

    /// Plain assistant text message.
    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), content_blocks: vec![] }
    }

    /// Build a User message carrying tool results.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content: String::new(), content_blocks: results }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

// ── Tool use types ──

/// Tool definition sent in requests (name + description + JSON Schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
    Image { media_type: String, data: String },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub thinking_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens + self.thinking_tokens
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// LLM completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// System prompt, sent out-of-band where the API supports it.
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Extended-thinking token budget. None disables thinking.
    pub thinking_budget: Option<u32>,
    /// Tool definitions for native tool use (empty = no tools).
    pub tools: Vec<ToolDefinition>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            messages: vec![],
            system: None,
            max_tokens: 4096,
            temperature: 0.7,
            thinking_budget: None,
            tools: vec![],
        }
    }
}

/// LLM completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Convenience: concatenation of all Text blocks.
    pub content: String,
    /// Concatenation of Thinking blocks, when the model emitted any.
    pub thinking: Option<String>,
    /// Structured content blocks from the model.
    pub content_blocks: Vec<ContentBlock>,
    /// Why the model stopped.
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// Tool invocations requested by this response, in emission order.
    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        self.content_blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    args: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Build a text-only response (used by tests and mock providers).
    pub fn text(content: impl Into<String>) -> Self {
        let text = content.into();
        Self {
            content: text.clone(),
            thinking: None,
            content_blocks: vec![ContentBlock::Text { text }],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        }
    }
}

/// Error type for LLM operations, mapped from transport status.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    /// 401/403 — fatal, no retry.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// 429 — retry after the advisory delay.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    /// 5xx — transient, retryable.
    #[error("server error: {0}")]
    ServerError(String),
    /// Anything else — fatal for this request.
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    /// True when the caller should retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ServerError(_))
    }
}

/// Trait for LLM providers (Anthropic, OpenAI-compatible, mocks).
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>>;
}

/// Mock provider for testing — returns a fixed response.
#[derive(Debug, Clone)]
pub struct MockProvider {
    pub response_blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl MockProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response_blocks: vec![ContentBlock::Text { text: response.into() }],
            stop_reason: StopReason::EndTurn,
        }
    }

    /// Create a mock that returns specific content blocks and stop reason.
    pub fn with_blocks(blocks: Vec<ContentBlock>, stop_reason: StopReason) -> Self {
        Self { response_blocks: blocks, stop_reason }
    }
}

fn response_from_blocks(blocks: Vec<ContentBlock>, stop_reason: StopReason) -> CompletionResponse {
    let content: String = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");
    let thinking: String = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Thinking { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");
    CompletionResponse {
        content,
        thinking: if thinking.is_empty() { None } else { Some(thinking) },
        content_blocks: blocks,
        stop_reason,
        usage: TokenUsage { input_tokens: 10, output_tokens: 20, thinking_tokens: 0 },
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        let blocks = self.response_blocks.clone();
        let stop = self.stop_reason;
        Box::pin(async move { Ok(response_from_blocks(blocks, stop)) })
    }
}

/// Scripted provider — pops a queued response per call, repeating the last
/// one once the queue is exhausted. Lets tests drive multi-turn loops.
pub struct ScriptedProvider {
    script: std::sync::Mutex<std::collections::VecDeque<CompletionResponse>>,
    last: std::sync::Mutex<Option<CompletionResponse>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            script: std::sync::Mutex::new(responses.into_iter().collect()),
            last: std::sync::Mutex::new(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of complete() calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let next = {
            let mut script = self.script.lock().expect("script lock");
            script.pop_front()
        };
        let response = match next {
            Some(r) => {
                *self.last.lock().expect("last lock") = Some(r.clone());
                r
            }
            None => self
                .last
                .lock()
                .expect("last lock")
                .clone()
                .unwrap_or_else(|| CompletionResponse::text("")),
        };
        Box::pin(async move { Ok(response) })
    }
}
