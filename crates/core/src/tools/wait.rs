//! Wait tool: sleep between 1 and 60 seconds.

use std::time::Duration;

use super::{Tool, ToolContext, ToolResult};

const MIN_SECS: u64 = 1;
const MAX_SECS: u64 = 60;

pub struct WaitTool;

#[async_trait::async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Pause for a number of seconds (1-60) before continuing"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "seconds": { "type": "integer", "minimum": 1, "maximum": 60 }
            },
            "required": ["seconds"]
        })
    }

    fn max_runtime(&self, _ctx: &ToolContext) -> Duration {
        Duration::from_secs(MAX_SECS + 1)
    }

    async fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> ToolResult {
        let seconds =
            args.get("seconds").and_then(|v| v.as_u64()).unwrap_or(MIN_SECS).clamp(MIN_SECS, MAX_SECS);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        ToolResult::ok(format!("waited {seconds}s"))
    }
}
