//! HTTP-based LLM providers.
//!
//! Supports Anthropic's native Messages API (tool use, extended thinking,
//! image blocks) and OpenAI-compatible chat-completions APIs.

use crate::provider::{
    CompletionRequest, CompletionResponse, ContentBlock, LlmError, LlmProvider, Role, StopReason,
    TokenUsage, ToolDefinition,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Inferred provider kind from model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
    /// Falls back to OpenAI-compatible format.
    Unknown,
}

impl ProviderKind {
    /// Infer provider from model name prefix.
    pub fn from_model(model: &str) -> Self {
        let m = model.to_lowercase();
        if m.starts_with("gpt-")
            || m.starts_with("o1-")
            || m.starts_with("o3-")
            || m.starts_with("o4-")
        {
            Self::OpenAi
        } else if m.starts_with("claude-") {
            Self::Anthropic
        } else if m.starts_with("gemini-") {
            Self::Google
        } else if m.starts_with("deepseek-") {
            Self::DeepSeek
        } else {
            Self::Unknown
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi | Self::Unknown => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
            Self::DeepSeek => "https://api.deepseek.com",
        }
    }

    fn is_anthropic(self) -> bool {
        matches!(self, Self::Anthropic)
    }
}

// ── OpenAI-compatible request/response types ──

#[derive(Serialize)]
struct OaiRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct OaiResponse {
    choices: Vec<OaiChoice>,
    usage: Option<OaiUsage>,
}

#[derive(Deserialize)]
struct OaiChoice {
    message: OaiChoiceMessage,
}

#[derive(Deserialize)]
struct OaiChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct OaiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ── Anthropic Messages API types ──

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicToolDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<AnthropicThinking>,
}

#[derive(Serialize)]
struct AnthropicThinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: AnthropicMessageContent,
}

/// Message content: either a plain string or an array of content blocks.
#[derive(Serialize)]
#[serde(untagged)]
enum AnthropicMessageContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

/// A content block in an Anthropic message (request side).
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
    Image { source: AnthropicImageSource },
}

#[derive(Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Serialize)]
struct AnthropicToolDef {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

impl From<&ToolDefinition> for AnthropicToolDef {
    fn from(td: &ToolDefinition) -> Self {
        Self {
            name: td.name.clone(),
            description: td.description.clone(),
            input_schema: td.input_schema.clone(),
        }
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
    usage: Option<AnthropicUsage>,
    stop_reason: Option<String>,
}

/// A content block in an Anthropic response.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

// ── Provider ──

/// HTTP-based LLM provider. Handles both OpenAI-compatible and Anthropic APIs.
pub struct HttpProvider {
    kind: ProviderKind,
    model: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    /// Build from model name + API key + optional base URL override.
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        let kind = ProviderKind::from_model(&model);
        let base = base_url.unwrap_or_else(|| kind.default_base_url().to_owned());
        Self {
            kind,
            model,
            client: reqwest::Client::new(),
            base_url: base.trim_end_matches('/').to_owned(),
            api_key,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        if self.kind.is_anthropic() {
            format!("{}/v1/messages", self.base_url)
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Map an HTTP error status to the error taxonomy:
/// 401/403 → AuthFailed, 429 → RateLimited (retry-after header, ms),
/// 5xx → ServerError, anything else → RequestFailed.
fn check_error(status: reqwest::StatusCode, retry_after: Option<u64>, body: String) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::AuthFailed(body),
        429 => LlmError::RateLimited { retry_after_ms: retry_after.unwrap_or(1000) },
        500..=599 => LlmError::ServerError(format!("{status}: {body}")),
        _ => LlmError::RequestFailed(format!("{status}: {body}")),
    }
}

/// Parse a Retry-After header value (seconds) into milliseconds.
fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs * 1000)
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        match self.kind {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Unknown => "unknown",
        }
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        if self.kind.is_anthropic() {
            Box::pin(self.complete_anthropic(request))
        } else {
            Box::pin(self.complete_openai(request))
        }
    }
}

impl HttpProvider {
    /// OpenAI-compatible completion (OpenAI, Gemini, DeepSeek, Unknown).
    /// Tools and thinking not supported on this path.
    async fn complete_openai(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let mut messages: Vec<OaiMessage> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OaiMessage { role: "system", content: system.clone() });
        }
        messages.extend(request.messages.iter().map(|m| OaiMessage {
            role: role_str(&m.role),
            content: m.content.clone(),
        }));

        let body = OaiRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let retry = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "LLM request failed");
            return Err(check_error(status, retry, text));
        }

        let api: OaiResponse =
            resp.json().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let content = api.choices.into_iter().next().map(|c| c.message.content).unwrap_or_default();
        let usage = api
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                thinking_tokens: 0,
            })
            .unwrap_or_default();

        let blocks = vec![ContentBlock::Text { text: content.clone() }];
        Ok(CompletionResponse {
            content,
            thinking: None,
            content_blocks: blocks,
            stop_reason: StopReason::EndTurn,
            usage,
        })
    }

    /// Anthropic Messages API completion with native tool use, thinking
    /// and image blocks.
    async fn complete_anthropic(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        // System prompt rides at top level; a stray System role message wins
        // over the request field for backwards compatibility.
        let mut system = request.system.clone();
        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .filter_map(|m| {
                if m.role == Role::System {
                    system = Some(m.content.clone());
                    None
                } else if m.content_blocks.is_empty() {
                    Some(AnthropicMessage {
                        role: role_str(&m.role),
                        content: AnthropicMessageContent::Text(m.content.clone()),
                    })
                } else {
                    let blocks: Vec<AnthropicBlock> = m
                        .content_blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => {
                                Some(AnthropicBlock::Text { text: text.clone() })
                            }
                            // Thinking blocks are model output; never echoed back.
                            ContentBlock::Thinking { .. } => None,
                            ContentBlock::ToolUse { id, name, input } => {
                                Some(AnthropicBlock::ToolUse {
                                    id: id.clone(),
                                    name: name.clone(),
                                    input: input.clone(),
                                })
                            }
                            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                                Some(AnthropicBlock::ToolResult {
                                    tool_use_id: tool_use_id.clone(),
                                    content: content.clone(),
                                    is_error: *is_error,
                                })
                            }
                            ContentBlock::Image { media_type, data } => {
                                Some(AnthropicBlock::Image {
                                    source: AnthropicImageSource {
                                        kind: "base64",
                                        media_type: media_type.clone(),
                                        data: data.clone(),
                                    },
                                })
                            }
                        })
                        .collect();
                    Some(AnthropicMessage {
                        role: role_str(&m.role),
                        content: AnthropicMessageContent::Blocks(blocks),
                    })
                }
            })
            .collect();

        let tools: Vec<AnthropicToolDef> = request.tools.iter().map(AnthropicToolDef::from).collect();
        let thinking = request
            .thinking_budget
            .filter(|&b| b > 0)
            .map(|budget_tokens| AnthropicThinking { kind: "enabled", budget_tokens });

        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            system,
            messages,
            temperature: request.temperature,
            tools,
            thinking,
        };

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let retry = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "LLM request failed");
            return Err(check_error(status, retry, text));
        }

        let api: AnthropicResponse =
            resp.json().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let content_blocks: Vec<ContentBlock> = api
            .content
            .into_iter()
            .map(|b| match b {
                AnthropicResponseBlock::Text { text } => ContentBlock::Text { text },
                AnthropicResponseBlock::Thinking { thinking } => {
                    ContentBlock::Thinking { text: thinking }
                }
                AnthropicResponseBlock::ToolUse { id, name, input } => {
                    ContentBlock::ToolUse { id, name, input }
                }
            })
            .collect();

        let content: String = content_blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        let thinking: String = content_blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let stop_reason = match api.stop_reason.as_deref() {
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };

        let usage = api
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                thinking_tokens: 0,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
            content_blocks,
            stop_reason,
            usage,
        })
    }
}

/// Build an LlmProvider from environment variables.
/// Reads `<model_env_key>`, `ANIMA_LLM_API_KEY`, optionally `ANIMA_LLM_BASE_URL`.
/// Returns `None` if model or key is not set.
pub fn from_env_with_model_var(model_env_key: &str) -> Option<HttpProvider> {
    let model = std::env::var(model_env_key).ok()?;
    let api_key = std::env::var("ANIMA_LLM_API_KEY").ok()?;
    let base_url = std::env::var("ANIMA_LLM_BASE_URL").ok();
    Some(HttpProvider::new(model, api_key, base_url))
}

/// Build the primary provider from `ANIMA_LLM_MODEL`.
pub fn from_env() -> Option<HttpProvider> {
    from_env_with_model_var("ANIMA_LLM_MODEL")
}

/// Build the reflection (small) provider from `ANIMA_LLM_LITE_MODEL`.
pub fn reflection_from_env() -> Option<HttpProvider> {
    from_env_with_model_var("ANIMA_LLM_LITE_MODEL")
}
