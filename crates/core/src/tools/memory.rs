//! Memory tool: thin wrapper over the store's memory KV.

use super::{Tool, ToolContext, ToolResult};
use crate::store::memory;

pub struct MemoryTool;

#[async_trait::async_trait]
impl Tool for MemoryTool {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "Persistent memory: save, get, search, delete or list entries by key"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["save", "get", "search", "delete", "list"] },
                "key": { "type": "string" },
                "value": { "type": "string" },
                "category": { "type": "string", "default": "general" },
                "importance": { "type": "integer", "minimum": 1, "maximum": 10, "default": 5 },
                "query": { "type": "string", "description": "Search query" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(action) = args.get("action").and_then(|v| v.as_str()) else {
            return ToolResult::fail("memory requires an 'action' argument");
        };
        let pool = ctx.store.pool();

        match action {
            "save" => {
                let (Some(key), Some(value)) = (
                    args.get("key").and_then(|v| v.as_str()),
                    args.get("value").and_then(|v| v.as_str()),
                ) else {
                    return ToolResult::fail("memory save requires 'key' and 'value'");
                };
                let category = args.get("category").and_then(|v| v.as_str()).unwrap_or("general");
                let importance = args.get("importance").and_then(|v| v.as_i64()).unwrap_or(5);
                match memory::upsert(pool, key, value, category, importance).await {
                    Ok(()) => ToolResult::ok(format!("saved memory {key:?}")),
                    Err(e) => ToolResult::fail(format!("memory save failed: {e}")),
                }
            }
            "get" => {
                let Some(key) = args.get("key").and_then(|v| v.as_str()) else {
                    return ToolResult::fail("memory get requires 'key'");
                };
                match memory::get(pool, key).await {
                    Ok(Some(entry)) => ToolResult::ok(format!(
                        "{} [{}, importance {}]: {}",
                        entry.key, entry.category, entry.importance, entry.value
                    )),
                    Ok(None) => ToolResult::fail(format!("no memory with key {key:?}")),
                    Err(e) => ToolResult::fail(format!("memory get failed: {e}")),
                }
            }
            "search" => {
                let Some(query) = args.get("query").and_then(|v| v.as_str()) else {
                    return ToolResult::fail("memory search requires 'query'");
                };
                match memory::search(pool, query, 10).await {
                    Ok(hits) if hits.is_empty() => ToolResult::ok("no matching memories"),
                    Ok(hits) => {
                        let lines: Vec<String> = hits
                            .iter()
                            .map(|e| format!("- {} [{}]: {}", e.key, e.category, e.value))
                            .collect();
                        ToolResult::ok(lines.join("\n"))
                    }
                    Err(e) => ToolResult::fail(format!("memory search failed: {e}")),
                }
            }
            "delete" => {
                let Some(key) = args.get("key").and_then(|v| v.as_str()) else {
                    return ToolResult::fail("memory delete requires 'key'");
                };
                match memory::delete(pool, key).await {
                    Ok(true) => ToolResult::ok(format!("deleted memory {key:?}")),
                    Ok(false) => ToolResult::fail(format!("no memory with key {key:?}")),
                    Err(e) => ToolResult::fail(format!("memory delete failed: {e}")),
                }
            }
            "list" => match memory::list_recent(pool, 20).await {
                Ok(entries) => {
                    let lines: Vec<String> =
                        entries.iter().map(|e| format!("- {} [{}]", e.key, e.category)).collect();
                    ToolResult::ok(lines.join("\n"))
                }
                Err(e) => ToolResult::fail(format!("memory list failed: {e}")),
            },
            other => ToolResult::fail(format!("unknown memory action: {other}")),
        }
    }
}
