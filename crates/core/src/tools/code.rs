//! Code tool: materialize a snippet to a temp file and run it under the
//! matching interpreter with a timeout.

use std::io::Write;
use std::time::Duration;

use super::{Tool, ToolContext, ToolResult};

const MAX_OUTPUT: usize = 64 * 1024;

struct Language {
    name: &'static str,
    interpreter: &'static str,
    suffix: &'static str,
}

const LANGUAGES: [Language; 3] = [
    Language { name: "python", interpreter: "python3", suffix: ".py" },
    Language { name: "javascript", interpreter: "node", suffix: ".js" },
    Language { name: "bash", interpreter: "bash", suffix: ".sh" },
];

fn language_for(name: &str) -> Option<&'static Language> {
    let lower = name.to_lowercase();
    let lower = match lower.as_str() {
        "py" => "python",
        "js" | "node" => "javascript",
        "sh" => "bash",
        other => other,
    };
    LANGUAGES.iter().find(|l| l.name == lower)
}

pub struct CodeTool;

#[async_trait::async_trait]
impl Tool for CodeTool {
    fn name(&self) -> &str {
        "code"
    }

    fn description(&self) -> &str {
        "Execute a code snippet (python, javascript or bash) and return its output"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "language": { "type": "string", "enum": ["python", "javascript", "bash"] },
                "source": { "type": "string", "description": "The snippet to run" }
            },
            "required": ["language", "source"]
        })
    }

    fn max_runtime(&self, ctx: &ToolContext) -> Duration {
        Duration::from_millis(ctx.config.code_timeout_ms) + Duration::from_secs(2)
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(language) = args.get("language").and_then(|v| v.as_str()) else {
            return ToolResult::fail("code requires a 'language' argument");
        };
        let Some(source) = args.get("source").and_then(|v| v.as_str()) else {
            return ToolResult::fail("code requires a 'source' argument");
        };
        let Some(lang) = language_for(language) else {
            return ToolResult::fail(format!(
                "unsupported language {language:?}, expected python/javascript/bash"
            ));
        };

        let mut tmp = match tempfile::Builder::new().prefix("anima-snippet").suffix(lang.suffix).tempfile()
        {
            Ok(f) => f,
            Err(e) => return ToolResult::fail(format!("cannot create temp file: {e}")),
        };
        if let Err(e) = tmp.write_all(source.as_bytes()) {
            return ToolResult::fail(format!("cannot write snippet: {e}"));
        }

        let timeout = Duration::from_millis(ctx.config.code_timeout_ms);
        let child = tokio::process::Command::new(lang.interpreter)
            .arg(tmp.path())
            .current_dir(&ctx.workspace)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::fail(format!("cannot spawn {}: {e}", lang.interpreter))
            }
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolResult::fail(format!("execution failed: {e}")),
            Err(_) => {
                return ToolResult::fail(format!(
                    "{} snippet timed out after {}ms",
                    lang.name,
                    timeout.as_millis()
                ))
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        if combined.len() > MAX_OUTPUT {
            let total = combined.len();
            combined.truncate(MAX_OUTPUT);
            combined.push_str(&format!("... [truncated, {total} bytes total]"));
        }

        if code == 0 {
            ToolResult::ok(combined)
        } else {
            ToolResult {
                success: false,
                output: combined,
                error: Some(format!("Exit code: {code}")),
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_context;

    #[test]
    fn language_aliases() {
        assert_eq!(language_for("py").unwrap().name, "python");
        assert_eq!(language_for("js").unwrap().name, "javascript");
        assert_eq!(language_for("node").unwrap().name, "javascript");
        assert_eq!(language_for("sh").unwrap().name, "bash");
        assert!(language_for("ruby").is_none());
    }

    #[tokio::test]
    async fn bash_snippet_runs() {
        let ctx = test_context().await;
        let result = CodeTool
            .execute(
                &serde_json::json!({"language": "bash", "source": "echo $((40 + 2))"}),
                &ctx,
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output.trim(), "42");
    }

    #[tokio::test]
    async fn python_snippet_runs() {
        let ctx = test_context().await;
        let result = CodeTool
            .execute(
                &serde_json::json!({"language": "python", "source": "print('UPPER'.lower())"}),
                &ctx,
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output.trim(), "upper");
    }

    #[tokio::test]
    async fn failing_snippet_reports_exit_code() {
        let ctx = test_context().await;
        let result = CodeTool
            .execute(&serde_json::json!({"language": "bash", "source": "exit 7"}), &ctx)
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Exit code: 7"));
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected() {
        let ctx = test_context().await;
        let result = CodeTool
            .execute(&serde_json::json!({"language": "cobol", "source": ""}), &ctx)
            .await;
        assert!(!result.success);
    }
}
