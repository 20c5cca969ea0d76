//! Tool executor: argument normalization for common LLM mistakes, retries
//! around transport-level failures, heartbeat progress while a tool is in
//! flight, and output shaping.

use std::time::Duration;
use tokio::sync::mpsc;

use crate::tools::{ToolContext, ToolRegistry, ToolResult};

/// Retries after the first attempt, with 2s/4s backoff.
const MAX_RETRIES: u32 = 2;
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ToolCallSpec {
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub name: String,
    pub response: ToolResult,
}

/// Progress note emitted every 5 s while a tool runs.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub tool: String,
    pub elapsed: Duration,
}

fn rename_key(args: &mut serde_json::Value, from: &str, to: &str) -> bool {
    let Some(obj) = args.as_object_mut() else { return false };
    if obj.contains_key(to) || !obj.contains_key(from) {
        return false;
    }
    if let Some(value) = obj.remove(from) {
        obj.insert(to.to_string(), value);
        return true;
    }
    false
}

fn rewrite_string(args: &mut serde_json::Value, key: &str, from: &str, to: &str) -> bool {
    let Some(value) = args.get_mut(key) else { return false };
    if value.as_str() == Some(from) {
        *value = serde_json::Value::String(to.to_string());
        return true;
    }
    false
}

/// Normalize one call in place, fixing the mistakes models actually make:
/// synonym action names, synonym parameter names, arrays where a scalar is
/// expected. Every applied fix is logged.
pub fn normalize(spec: &mut ToolCallSpec) {
    let mut applied: Vec<String> = Vec::new();

    // Parameter-name synonyms, per tool.
    let renames: &[(&str, &str)] = match spec.name.as_str() {
        "file" => &[
            ("file_path", "path"),
            ("filename", "path"),
            ("filepath", "path"),
            ("text", "content"),
            ("data", "content"),
            ("contents", "content"),
        ],
        "shell" => &[("cmd", "command"), ("script", "command"), ("timeout", "timeout_secs")],
        "web" => &[("website", "url"), ("link", "url"), ("uri", "url")],
        "browser" => &[("website", "url"), ("link", "url")],
        "code" => &[("lang", "language"), ("snippet", "source"), ("script", "source")],
        "wait" => &[("duration", "seconds"), ("secs", "seconds"), ("time", "seconds")],
        "memory" => &[("name", "key"), ("content", "value")],
        _ => &[],
    };
    for (from, to) in renames {
        if rename_key(&mut spec.args, from, to) {
            applied.push(format!("{from}->{to}"));
        }
    }

    // Action-name synonyms.
    match spec.name.as_str() {
        "file" => {
            for (from, to) in [("save", "write"), ("create", "write"), ("remove", "delete"), ("check", "exists")]
            {
                if rewrite_string(&mut spec.args, "action", from, to) {
                    applied.push(format!("action {from}->{to}"));
                }
            }
        }
        "browser" => {
            for (from, to) in [("visit", "navigate"), ("open", "navigate"), ("go", "navigate")] {
                if rewrite_string(&mut spec.args, "action", from, to) {
                    applied.push(format!("action {from}->{to}"));
                }
            }
            // search → navigate with a URL derived from the query.
            if spec.args.get("action").and_then(|v| v.as_str()) == Some("search") {
                let query = spec
                    .args
                    .get("query")
                    .or_else(|| spec.args.get("text"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if let Some(obj) = spec.args.as_object_mut() {
                    obj.insert("action".into(), "navigate".into());
                    obj.insert(
                        "url".into(),
                        format!(
                            "https://duckduckgo.com/html/?q={}",
                            url::form_urlencoded::byte_serialize(query.as_bytes())
                                .collect::<String>()
                        )
                        .into(),
                    );
                    applied.push("action search->navigate".into());
                }
            }
        }
        "memory" => {
            for (from, to) in [("store", "save"), ("set", "save"), ("recall", "get"), ("find", "search")]
            {
                if rewrite_string(&mut spec.args, "action", from, to) {
                    applied.push(format!("action {from}->{to}"));
                }
            }
        }
        _ => {}
    }

    // An array where a scalar is expected: take the first element.
    for key in ["url", "path", "command"] {
        let first = spec.args.get(key).and_then(|v| v.as_array()).and_then(|a| a.first()).cloned();
        if let Some(first) = first {
            spec.args[key] = first;
            applied.push(format!("{key}[0]"));
        }
    }

    if !applied.is_empty() {
        tracing::debug!(tool = %spec.name, fixes = ?applied, "normalized tool arguments");
    }
}

/// True when the failure is transport-level (tool crashed or the registry
/// deadline fired) rather than a tool-local failure the LLM should see.
fn is_transient(result: &ToolResult) -> bool {
    result
        .error
        .as_deref()
        .map(|e| e.contains("crashed during execution"))
        .unwrap_or(false)
}

async fn execute_with_heartbeat(
    registry: &ToolRegistry,
    ctx: &ToolContext,
    spec: &ToolCallSpec,
    heartbeat: Option<&mpsc::Sender<Heartbeat>>,
) -> ToolResult {
    let started = std::time::Instant::now();
    let fut = registry.execute(&spec.name, &spec.args, ctx);
    tokio::pin!(fut);

    let mut tick = tokio::time::interval(HEARTBEAT_EVERY);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            result = &mut fut => return result,
            _ = tick.tick() => {
                let note = Heartbeat { tool: spec.name.clone(), elapsed: started.elapsed() };
                tracing::debug!(tool = %note.tool, elapsed_ms = note.elapsed.as_millis() as u64, "tool still running");
                if let Some(tx) = heartbeat {
                    let _ = tx.try_send(note);
                }
            }
        }
    }
}

/// Shape one result: image-bearing results pass through untouched, text
/// output is truncated to the configured cap.
fn shape(mut result: ToolResult, max_output_chars: usize) -> ToolResult {
    if !result.images.is_empty() {
        return result;
    }
    let total_chars = result.output.chars().count();
    if total_chars > max_output_chars {
        let cut = total_chars - max_output_chars;
        result.output = result.output.chars().take(max_output_chars).collect();
        result.output.push_str(&format!("... [truncated {cut} chars]"));
    }
    result
}

/// Execute a batch of calls in input order. Each call is normalized,
/// retried on transient failure (2s, 4s backoff) and shaped.
pub async fn execute_batch(
    registry: &ToolRegistry,
    ctx: &ToolContext,
    calls: Vec<ToolCallSpec>,
    heartbeat: Option<mpsc::Sender<Heartbeat>>,
) -> Vec<ExecutedCall> {
    let mut out = Vec::with_capacity(calls.len());
    for mut spec in calls {
        normalize(&mut spec);

        let mut result =
            execute_with_heartbeat(registry, ctx, &spec, heartbeat.as_ref()).await;
        let mut attempt = 0;
        while is_transient(&result) && attempt < MAX_RETRIES {
            attempt += 1;
            let backoff = Duration::from_secs(2u64.pow(attempt));
            tracing::warn!(
                tool = %spec.name,
                attempt,
                backoff_secs = backoff.as_secs(),
                "transient tool failure, retrying"
            );
            tokio::time::sleep(backoff).await;
            result = execute_with_heartbeat(registry, ctx, &spec, heartbeat.as_ref()).await;
        }

        out.push(ExecutedCall {
            name: spec.name.clone(),
            response: shape(result, ctx.config.max_output_chars),
        });
    }
    out
}
