//! File tool: read/write/append/list/delete/exists/stat/send inside the
//! allow-list, with traversal and sensitive-name rejection.

use std::path::{Path, PathBuf};

use super::{FileArtifact, Tool, ToolContext, ToolResult};

const LIST_CAP: usize = 500;
const READ_CAP: usize = 256 * 1024;

/// File names that are never touched, whatever the directory.
const DENY_NAMES: [&str; 8] = [
    ".env",
    "id_rsa",
    "id_ed25519",
    "credentials",
    "secrets",
    ".netrc",
    ".htpasswd",
    "shadow",
];
const DENY_SUFFIXES: [&str; 3] = [".pem", ".key", ".p12"];

fn name_is_sensitive(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return false };
    let lower = name.to_lowercase();
    DENY_NAMES.iter().any(|d| lower == *d || lower.starts_with(&format!("{d}.")))
        || DENY_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Resolve a path for reading or writing. Traversal components are
/// rejected outright; the resolved path must live under an allowed root.
/// For writes the parent directory is resolved instead (the file itself
/// may not exist yet).
fn resolve(ctx: &ToolContext, raw: &str, for_write: bool) -> Result<PathBuf, String> {
    if raw.contains("..") || raw.starts_with('~') {
        return Err(format!("path {raw:?} contains traversal components"));
    }
    if name_is_sensitive(Path::new(raw)) {
        return Err(format!("path {raw:?} matches a protected file name"));
    }

    let path = PathBuf::from(raw);
    let absolute = if path.is_absolute() { path } else { ctx.workspace.join(path) };

    let check_target = if for_write && !absolute.exists() {
        absolute.parent().map(Path::to_path_buf).unwrap_or_else(|| absolute.clone())
    } else {
        absolute.clone()
    };
    let canonical = check_target
        .canonicalize()
        .map_err(|e| format!("cannot resolve {raw:?}: {e}"))?;

    let allowed = ctx.allowed_paths.iter().any(|root| {
        root.canonicalize().map(|r| canonical.starts_with(r)).unwrap_or(false)
    });
    if !allowed {
        return Err(format!("path {raw:?} is outside the allowed directories"));
    }
    Ok(absolute)
}

fn media_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "html" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

pub struct FileTool;

#[async_trait::async_trait]
impl Tool for FileTool {
    fn name(&self) -> &str {
        "file"
    }

    fn description(&self) -> &str {
        "File operations: read, write, append, list, delete, exists, stat, send"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["read", "write", "append", "list", "delete", "exists", "stat", "send"]
                },
                "path": { "type": "string" },
                "content": { "type": "string", "description": "Content for write/append" }
            },
            "required": ["action", "path"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(action) = args.get("action").and_then(|v| v.as_str()) else {
            return ToolResult::fail("file requires an 'action' argument");
        };
        let Some(raw_path) = args.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::fail("file requires a 'path' argument");
        };
        // `exists` resolves like a write so a missing file is an answer,
        // not an error.
        let for_write = matches!(action, "write" | "append" | "exists");
        let path = match resolve(ctx, raw_path, for_write) {
            Ok(p) => p,
            Err(e) => return ToolResult::fail(e),
        };

        match action {
            "read" => match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let mut text = String::from_utf8_lossy(&bytes).to_string();
                    if text.len() > READ_CAP {
                        let total = text.len();
                        text.truncate(READ_CAP);
                        text.push_str(&format!("... [truncated, {total} bytes total]"));
                    }
                    ToolResult::ok(text)
                }
                Err(e) => ToolResult::fail(format!("cannot read {raw_path:?}: {e}")),
            },
            "write" | "append" => {
                let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
                if let Some(parent) = path.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        return ToolResult::fail(format!("cannot create parent dirs: {e}"));
                    }
                }
                let result = if action == "write" {
                    tokio::fs::write(&path, content).await
                } else {
                    use tokio::io::AsyncWriteExt;
                    match tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                    {
                        Ok(mut f) => f.write_all(content.as_bytes()).await,
                        Err(e) => Err(e),
                    }
                };
                match result {
                    Ok(()) => ToolResult::ok(format!(
                        "{} {} bytes to {}",
                        if action == "write" { "wrote" } else { "appended" },
                        content.len(),
                        path.display()
                    )),
                    Err(e) => ToolResult::fail(format!("cannot {action} {raw_path:?}: {e}")),
                }
            }
            "list" => {
                let mut dir = match tokio::fs::read_dir(&path).await {
                    Ok(dir) => dir,
                    Err(e) => return ToolResult::fail(format!("cannot list {raw_path:?}: {e}")),
                };
                let mut entries = Vec::new();
                while let Ok(Some(entry)) = dir.next_entry().await {
                    let marker = entry
                        .file_type()
                        .await
                        .map(|t| if t.is_dir() { "/" } else { "" })
                        .unwrap_or("");
                    entries.push(format!("{}{marker}", entry.file_name().to_string_lossy()));
                    if entries.len() >= LIST_CAP {
                        break;
                    }
                }
                entries.sort();
                ToolResult::ok(entries.join("\n"))
            }
            "delete" => match tokio::fs::remove_file(&path).await {
                Ok(()) => ToolResult::ok(format!("deleted {}", path.display())),
                Err(e) => ToolResult::fail(format!("cannot delete {raw_path:?}: {e}")),
            },
            "exists" => ToolResult::ok(if path.exists() { "true" } else { "false" }),
            "stat" => match tokio::fs::metadata(&path).await {
                Ok(meta) => ToolResult::ok(format!(
                    "{}: {} bytes, {}",
                    path.display(),
                    meta.len(),
                    if meta.is_dir() { "directory" } else { "file" }
                )),
                Err(e) => ToolResult::fail(format!("cannot stat {raw_path:?}: {e}")),
            },
            // Send is a pure descriptor — delivery belongs to outer surfaces.
            "send" => {
                if !path.is_file() {
                    return ToolResult::fail(format!("cannot send {raw_path:?}: not a file"));
                }
                let artifact = FileArtifact {
                    path: path.display().to_string(),
                    media_type: media_type_for(&path).to_string(),
                };
                ToolResult::ok(format!("queued {} for delivery", path.display()))
                    .with_files(vec![artifact])
            }
            other => ToolResult::fail(format!("unknown file action: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_context;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let ctx = test_context().await;
        let write = FileTool
            .execute(
                &serde_json::json!({"action": "write", "path": "notes.txt", "content": "hello"}),
                &ctx,
            )
            .await;
        assert!(write.success, "{:?}", write.error);

        let read = FileTool
            .execute(&serde_json::json!({"action": "read", "path": "notes.txt"}), &ctx)
            .await;
        assert!(read.success);
        assert_eq!(read.output, "hello");
    }

    #[tokio::test]
    async fn append_extends_the_file() {
        let ctx = test_context().await;
        for chunk in ["a", "b"] {
            FileTool
                .execute(
                    &serde_json::json!({"action": "append", "path": "log.txt", "content": chunk}),
                    &ctx,
                )
                .await;
        }
        let read = FileTool
            .execute(&serde_json::json!({"action": "read", "path": "log.txt"}), &ctx)
            .await;
        assert_eq!(read.output, "ab");
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let ctx = test_context().await;
        let result = FileTool
            .execute(&serde_json::json!({"action": "read", "path": "../../etc/hosts"}), &ctx)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("traversal"));

        let result = FileTool
            .execute(&serde_json::json!({"action": "read", "path": "~/secrets.txt"}), &ctx)
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn outside_allowlist_is_rejected() {
        let ctx = test_context().await;
        let result = FileTool
            .execute(&serde_json::json!({"action": "read", "path": "/etc/hostname"}), &ctx)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("allowed"));
    }

    #[tokio::test]
    async fn sensitive_names_are_blocked() {
        let ctx = test_context().await;
        for path in [".env", "id_rsa", "server.pem", "signing.key", "credentials"] {
            let result = FileTool
                .execute(
                    &serde_json::json!({"action": "write", "path": path, "content": "x"}),
                    &ctx,
                )
                .await;
            assert!(!result.success, "{path} must be blocked");
        }
    }

    #[tokio::test]
    async fn exists_and_stat() {
        let ctx = test_context().await;
        FileTool
            .execute(
                &serde_json::json!({"action": "write", "path": "f.txt", "content": "12345"}),
                &ctx,
            )
            .await;
        let exists = FileTool
            .execute(&serde_json::json!({"action": "exists", "path": "f.txt"}), &ctx)
            .await;
        assert_eq!(exists.output, "true");
        let stat = FileTool
            .execute(&serde_json::json!({"action": "stat", "path": "f.txt"}), &ctx)
            .await;
        assert!(stat.output.contains("5 bytes"));
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let ctx = test_context().await;
        for name in ["b.txt", "a.txt"] {
            FileTool
                .execute(
                    &serde_json::json!({"action": "write", "path": name, "content": "x"}),
                    &ctx,
                )
                .await;
        }
        let list = FileTool
            .execute(&serde_json::json!({"action": "list", "path": "."}), &ctx)
            .await;
        let lines: Vec<&str> = list.output.lines().collect();
        assert_eq!(lines, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn send_returns_a_descriptor_only() {
        let ctx = test_context().await;
        FileTool
            .execute(
                &serde_json::json!({"action": "write", "path": "report.md", "content": "# hi"}),
                &ctx,
            )
            .await;
        let result = FileTool
            .execute(&serde_json::json!({"action": "send", "path": "report.md"}), &ctx)
            .await;
        assert!(result.success);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].media_type, "text/plain");
    }
}
