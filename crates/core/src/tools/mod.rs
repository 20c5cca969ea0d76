//! Tool registry: uniform dispatch for side-effecting capabilities.
//!
//! Each tool declares a name, a description and a JSON-schema for its
//! arguments, and executes against a shared [`ToolContext`]. The registry
//! validates lookup, measures wall-clock time and shields the loop from
//! panicking tools — an uncaught failure becomes a failure [`ToolResult`],
//! never an exception.

pub mod browser;
pub mod code;
pub mod file;
pub mod memory;
pub mod shell;
pub mod wait;
pub mod web;

use anima_llm::provider::ToolDefinition;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AgentConfig;
use crate::store::Store;

/// Image artifact carried by a tool result (e.g. a browser screenshot).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageArtifact {
    pub media_type: String,
    /// Base64-encoded payload.
    pub data: String,
    /// Stable id, resolvable by outer surfaces.
    pub id: String,
}

/// File artifact descriptor (the `send` file action).
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileArtifact {
    pub path: String,
    pub media_type: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageArtifact>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileArtifact>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into(), ..Default::default() }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Default::default() }
    }

    pub fn with_images(mut self, images: Vec<ImageArtifact>) -> Self {
        self.images = images;
        self
    }

    pub fn with_files(mut self, files: Vec<FileArtifact>) -> Self {
        self.files = files;
        self
    }
}

/// Shared execution context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub config: AgentConfig,
    pub store: Store,
    /// Root of the agent's scratch workspace.
    pub workspace: PathBuf,
    /// Directories file/shell operations may touch.
    pub allowed_paths: Vec<PathBuf>,
    pub screenshot_dir: PathBuf,
}

impl ToolContext {
    pub fn new(config: AgentConfig, store: Store, workspace: PathBuf) -> Self {
        let screenshot_dir = workspace.join("screenshots");
        let allowed_paths = vec![workspace.clone(), std::env::temp_dir()];
        Self { config, store, workspace, allowed_paths, screenshot_dir }
    }
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> serde_json::Value;

    /// Hard ceiling for one invocation. Defaults to the configured tool
    /// timeout; tools with their own deadline policy override this.
    fn max_runtime(&self, ctx: &ToolContext) -> Duration {
        Duration::from_millis(ctx.config.tool_timeout_ms)
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> ToolResult;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in tool.
    pub fn with_builtins(browser_host: Arc<browser::BrowserHost>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(shell::ShellTool));
        registry.register(Arc::new(file::FileTool));
        registry.register(Arc::new(web::WebTool::new()));
        registry.register(Arc::new(code::CodeTool));
        registry.register(Arc::new(browser::BrowserTool::new(browser_host)));
        registry.register(Arc::new(memory::MemoryTool));
        registry.register(Arc::new(wait::WaitTool));
        registry
    }

    /// Idempotent by name — registering the same name again replaces the
    /// previous tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Declarations only, sorted by name for determinism.
    pub fn declarations(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute by name. Unknown names and uncaught tool failures both come
    /// back as failure results; wall-clock time is always filled in.
    pub async fn execute(
        &self,
        name: &str,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolResult {
        let start = Instant::now();
        let Some(tool) = self.lookup(name) else {
            let mut result = ToolResult::fail(format!(
                "tool not found: {name}. Available tools: {}",
                self.names().join(", ")
            ));
            result.execution_time_ms = start.elapsed().as_millis() as u64;
            return result;
        };

        let deadline = tool.max_runtime(ctx);
        let outcome = tokio::time::timeout(
            deadline,
            std::panic::AssertUnwindSafe(tool.execute(args, ctx)).catch_unwind(),
        )
        .await;

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                tracing::error!(tool = name, "tool panicked");
                ToolResult::fail(format!("{name} crashed during execution"))
            }
            Err(_) => ToolResult::fail(format!("{name} timed out after {}ms", deadline.as_millis())),
        };
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        result
    }
}

#[cfg(test)]
pub(crate) async fn test_context() -> ToolContext {
    let store = Store::open_in_memory().await.expect("in-memory store");
    let workspace = std::env::temp_dir().join(format!("anima-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&workspace).expect("workspace dir");
    ToolContext::new(AgentConfig::default(), store, workspace)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok(args.get("text").and_then(|v| v.as_str()).unwrap_or(""))
        }
    }

    struct PanicTool;

    #[async_trait::async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "bomb"
        }
        fn description(&self) -> &str {
            "Always panics"
        }
        fn schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: &serde_json::Value, _ctx: &ToolContext) -> ToolResult {
            panic!("boom")
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failure_result() {
        let registry = ToolRegistry::new();
        let ctx = test_context().await;
        let result = registry.execute("ghost", &serde_json::json!({}), &ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("tool not found"));
    }

    #[tokio::test]
    async fn register_last_wins() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(EchoTool));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn execute_measures_time_and_returns_output() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let ctx = test_context().await;
        let result = registry.execute("echo", &serde_json::json!({"text": "hi"}), &ctx).await;
        assert!(result.success);
        assert_eq!(result.output, "hi");
    }

    #[tokio::test]
    async fn panicking_tool_becomes_failure_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(PanicTool));
        let ctx = test_context().await;
        let result = registry.execute("bomb", &serde_json::json!({}), &ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("crashed"));
    }

    #[tokio::test]
    async fn declarations_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(PanicTool));
        let names: Vec<String> =
            registry.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["bomb", "echo"]);
    }
}
