//! Headless-browser tool driven over the Chrome DevTools Protocol.
//!
//! One browser process and one page are shared by all invocations,
//! serialized through the host's mutex. The browser is launched lazily
//! with `--remote-debugging-port=0` and controlled over its DevTools
//! WebSocket. Policy: the browser is force-recycled past a maximum age,
//! the connection is dropped after an idle period, and a janitor task
//! keeps the screenshot directory bounded.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{ImageArtifact, Tool, ToolContext, ToolResult};

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(20);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const NAVIGATE_SETTLE: Duration = Duration::from_secs(10);
const CONTENT_CAP: usize = 100 * 1024;

#[derive(Debug, Clone)]
pub struct BrowserPolicy {
    /// Force-recycle the browser process past this age.
    pub max_age: Duration,
    /// Drop the connection (and page) after this much idle time.
    pub idle_close: Duration,
    /// Screenshots older than this are deleted by the janitor.
    pub screenshot_retention: Duration,
    /// At most this many screenshots are kept.
    pub screenshot_cap: usize,
}

impl Default for BrowserPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            idle_close: Duration::from_secs(5 * 60),
            screenshot_retention: Duration::from_secs(24 * 60 * 60),
            screenshot_cap: 100,
        }
    }
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct CdpSession {
    child: tokio::process::Child,
    ws: Ws,
    session_id: String,
    next_id: u64,
    started_at: Instant,
    last_used: Instant,
    // Dropped (and deleted) together with the session.
    _profile_dir: tempfile::TempDir,
}

impl CdpSession {
    /// Send one CDP command and wait for its response, ignoring events.
    async fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        self.next_id += 1;
        let id = self.next_id;
        let mut message = serde_json::json!({ "id": id, "method": method, "params": params });
        if !self.session_id.is_empty() && !method.starts_with("Target.") {
            message["sessionId"] = serde_json::Value::String(self.session_id.clone());
        }
        self.ws
            .send(Message::Text(message.to_string().into()))
            .await
            .map_err(|e| format!("CDP send failed: {e}"))?;

        let deadline = tokio::time::sleep(CALL_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Err(format!("CDP call {method} timed out")),
                frame = self.ws.next() => {
                    let Some(frame) = frame else { return Err("CDP socket closed".into()) };
                    let frame = frame.map_err(|e| format!("CDP read failed: {e}"))?;
                    let Message::Text(text) = frame else { continue };
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    if value.get("id").and_then(|v| v.as_u64()) != Some(id) {
                        continue; // event or another command's response
                    }
                    if let Some(error) = value.get("error") {
                        return Err(format!("CDP {method} error: {error}"));
                    }
                    return Ok(value.get("result").cloned().unwrap_or_default());
                }
            }
        }
    }

    /// Evaluate a JS expression on the page, returning its value.
    async fn evaluate(&mut self, expression: &str) -> Result<serde_json::Value, String> {
        let result = self
            .call(
                "Runtime.evaluate",
                serde_json::json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .unwrap_or("evaluation failed");
            return Err(text.to_string());
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(serde_json::Value::Null))
    }
}

/// Parse the DevTools WebSocket URL from a chromium stderr line.
fn parse_devtools_url(line: &str) -> Option<String> {
    let marker = "DevTools listening on ";
    line.find(marker).map(|i| line[i + marker.len()..].trim().to_string())
}

const BROWSER_BINARIES: [&str; 4] =
    ["chromium", "chromium-browser", "google-chrome", "chrome"];

pub struct BrowserHost {
    policy: BrowserPolicy,
    session: tokio::sync::Mutex<Option<CdpSession>>,
}

impl BrowserHost {
    pub fn new(policy: BrowserPolicy) -> Self {
        Self { policy, session: tokio::sync::Mutex::new(None) }
    }

    async fn launch() -> Result<CdpSession, String> {
        let profile_dir =
            tempfile::tempdir().map_err(|e| format!("cannot create profile dir: {e}"))?;

        let mut spawned = None;
        for binary in BROWSER_BINARIES {
            let attempt = tokio::process::Command::new(binary)
                .arg("--headless=new")
                .arg("--disable-gpu")
                .arg("--no-first-run")
                .arg("--remote-debugging-port=0")
                .arg(format!("--user-data-dir={}", profile_dir.path().display()))
                .arg("about:blank")
                .stderr(std::process::Stdio::piped())
                .stdout(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn();
            if let Ok(child) = attempt {
                spawned = Some(child);
                break;
            }
        }
        let mut child =
            spawned.ok_or_else(|| "no chromium/chrome binary found on PATH".to_string())?;

        // Chromium prints the DevTools endpoint on stderr.
        let stderr = child.stderr.take().ok_or("no stderr from browser process")?;
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        let ws_url = tokio::time::timeout(LAUNCH_TIMEOUT, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(url) = parse_devtools_url(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await
        .map_err(|_| "browser did not report a DevTools endpoint in time".to_string())?
        .ok_or("browser exited before reporting a DevTools endpoint")?;

        let (ws, _) =
            connect_async(ws_url.as_str()).await.map_err(|e| format!("CDP connect failed: {e}"))?;

        let mut session = CdpSession {
            child,
            ws,
            session_id: String::new(),
            next_id: 0,
            started_at: Instant::now(),
            last_used: Instant::now(),
            _profile_dir: profile_dir,
        };

        // Create and attach the single shared page.
        let target = session
            .call("Target.createTarget", serde_json::json!({ "url": "about:blank" }))
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or("no targetId from browser")?
            .to_string();
        let attached = session
            .call(
                "Target.attachToTarget",
                serde_json::json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        session.session_id = attached
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or("no sessionId from browser")?
            .to_string();
        session.call("Page.enable", serde_json::json!({})).await?;
        session.call("Runtime.enable", serde_json::json!({})).await?;

        tracing::info!("headless browser launched");
        Ok(session)
    }

    /// Run `f` against the shared session, starting or recycling the
    /// browser as the age policy requires. Access is serialized.
    async fn with_session<F, T>(&self, f: F) -> Result<T, String>
    where
        F: for<'s> FnOnce(
            &'s mut CdpSession,
        )
            -> futures_util::future::BoxFuture<'s, Result<T, String>>,
    {
        let mut guard = self.session.lock().await;

        let expired = guard
            .as_ref()
            .map(|s| s.started_at.elapsed() > self.policy.max_age)
            .unwrap_or(false);
        if expired {
            tracing::info!("recycling browser past max age");
            if let Some(mut old) = guard.take() {
                let _ = old.child.start_kill();
            }
        }
        if guard.is_none() {
            *guard = Some(Self::launch().await?);
        }
        let session = guard.as_mut().expect("session present");
        session.last_used = Instant::now();

        match f(session).await {
            Ok(value) => Ok(value),
            Err(e) => {
                // A dead socket poisons the singleton; drop it so the next
                // call relaunches.
                if e.contains("socket closed") || e.contains("send failed") {
                    let mut dead = guard.take().expect("session present");
                    let _ = dead.child.start_kill();
                }
                Err(e)
            }
        }
    }

    /// Close an idle session. Called by the maintenance task.
    async fn close_if_idle(&self) {
        let mut guard = self.session.lock().await;
        let idle = guard
            .as_ref()
            .map(|s| s.last_used.elapsed() > self.policy.idle_close)
            .unwrap_or(false);
        if idle {
            tracing::info!("closing idle browser");
            if let Some(mut old) = guard.take() {
                let _ = old.child.start_kill();
            }
        }
    }

    /// Spawn the maintenance task: idle close + screenshot janitor.
    pub fn spawn_maintenance(
        self: std::sync::Arc<Self>,
        screenshot_dir: PathBuf,
        token: CancellationToken,
    ) {
        let host = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        host.shutdown().await;
                        break;
                    }
                    _ = tick.tick() => {
                        host.close_if_idle().await;
                        janitor_sweep(
                            &screenshot_dir,
                            host.policy.screenshot_retention,
                            host.policy.screenshot_cap,
                        );
                    }
                }
            }
        });
    }

    /// Kill the browser process, if any.
    pub async fn shutdown(&self) {
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            let _ = session.child.start_kill();
        }
    }
}

/// Delete screenshots past retention and trim the directory to the cap,
/// newest kept.
fn janitor_sweep(dir: &Path, retention: Duration, cap: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((e.path(), modified))
        })
        .collect();

    let now = std::time::SystemTime::now();
    files.retain(|(path, modified)| {
        let expired =
            now.duration_since(*modified).map(|age| age > retention).unwrap_or(false);
        if expired {
            let _ = std::fs::remove_file(path);
        }
        !expired
    });

    if files.len() > cap {
        // Oldest first; everything beyond the cap goes.
        files.sort_by_key(|(_, modified)| *modified);
        let excess = files.len() - cap;
        for (path, _) in files.into_iter().take(excess) {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub struct BrowserTool {
    host: std::sync::Arc<BrowserHost>,
}

impl BrowserTool {
    pub fn new(host: std::sync::Arc<BrowserHost>) -> Self {
        Self { host }
    }
}

#[async_trait::async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Headless browser: navigate, screenshot, click, type, evaluate, content"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["navigate", "screenshot", "click", "type", "evaluate", "content"]
                },
                "url": { "type": "string", "description": "Target URL for navigate" },
                "selector": { "type": "string", "description": "CSS selector for click/type" },
                "text": { "type": "string", "description": "Text to type" },
                "expression": { "type": "string", "description": "JS expression for evaluate" }
            },
            "required": ["action"]
        })
    }

    fn max_runtime(&self, _ctx: &ToolContext) -> Duration {
        LAUNCH_TIMEOUT + CALL_TIMEOUT + NAVIGATE_SETTLE + Duration::from_secs(5)
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(action) = args.get("action").and_then(|v| v.as_str()) else {
            return ToolResult::fail("browser requires an 'action' argument");
        };

        match action {
            "navigate" => {
                let Some(url) = args.get("url").and_then(|v| v.as_str()) else {
                    return ToolResult::fail("browser navigate requires 'url'");
                };
                let url = match super::web::validate_url(url) {
                    Ok(url) => url.to_string(),
                    Err(e) => return ToolResult::fail(e),
                };
                let outcome = self
                    .host
                    .with_session(|session| {
                        let url = url.clone();
                        Box::pin(async move {
                            session
                                .call("Page.navigate", serde_json::json!({ "url": url }))
                                .await?;
                            // Poll readyState rather than chasing lifecycle
                            // events; good enough for a single shared page.
                            let deadline = Instant::now() + NAVIGATE_SETTLE;
                            loop {
                                let state = session.evaluate("document.readyState").await?;
                                if state.as_str() == Some("complete")
                                    || Instant::now() >= deadline
                                {
                                    break;
                                }
                                tokio::time::sleep(Duration::from_millis(250)).await;
                            }
                            session.evaluate("document.title").await
                        })
                    })
                    .await;
                match outcome {
                    Ok(title) => ToolResult::ok(format!(
                        "navigated to {url} (title: {})",
                        title.as_str().unwrap_or("")
                    )),
                    Err(e) => ToolResult::fail(e),
                }
            }
            "screenshot" => {
                let outcome = self
                    .host
                    .with_session(|session| {
                        Box::pin(async move {
                            session
                                .call(
                                    "Page.captureScreenshot",
                                    serde_json::json!({ "format": "jpeg", "quality": 80 }),
                                )
                                .await
                        })
                    })
                    .await;
                let result = match outcome {
                    Ok(result) => result,
                    Err(e) => return ToolResult::fail(e),
                };
                let Some(data) = result.get("data").and_then(|v| v.as_str()) else {
                    return ToolResult::fail("browser returned no screenshot data");
                };

                let id = format!("shot-{}", uuid::Uuid::new_v4());
                if let Err(e) = std::fs::create_dir_all(&ctx.screenshot_dir) {
                    return ToolResult::fail(format!("cannot create screenshot dir: {e}"));
                }
                let path = ctx.screenshot_dir.join(format!("{id}.jpg"));
                match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(bytes) => {
                        if let Err(e) = std::fs::write(&path, bytes) {
                            return ToolResult::fail(format!("cannot save screenshot: {e}"));
                        }
                    }
                    Err(e) => return ToolResult::fail(format!("bad screenshot payload: {e}")),
                }

                ToolResult::ok(format!("screenshot saved to {}", path.display())).with_images(
                    vec![ImageArtifact {
                        media_type: "image/jpeg".into(),
                        data: data.to_string(),
                        id,
                    }],
                )
            }
            "click" => {
                let Some(selector) = args.get("selector").and_then(|v| v.as_str()) else {
                    return ToolResult::fail("browser click requires 'selector'");
                };
                let expression = format!(
                    "(() => {{ const el = document.querySelector({sel}); \
                     if (!el) return 'no element'; el.click(); return 'clicked'; }})()",
                    sel = serde_json::Value::String(selector.to_string())
                );
                self.run_js(&expression, |value| {
                    if value.as_str() == Some("clicked") {
                        ToolResult::ok(format!("clicked {selector}"))
                    } else {
                        ToolResult::fail(format!("no element matches {selector:?}"))
                    }
                })
                .await
            }
            "type" => {
                let Some(text) = args.get("text").and_then(|v| v.as_str()) else {
                    return ToolResult::fail("browser type requires 'text'");
                };
                if let Some(selector) = args.get("selector").and_then(|v| v.as_str()) {
                    let expression = format!(
                        "(() => {{ const el = document.querySelector({sel}); \
                         if (!el) return 'no element'; el.focus(); el.value = {val}; \
                         el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
                         return 'typed'; }})()",
                        sel = serde_json::Value::String(selector.to_string()),
                        val = serde_json::Value::String(text.to_string())
                    );
                    self.run_js(&expression, |value| {
                        if value.as_str() == Some("typed") {
                            ToolResult::ok("typed into element")
                        } else {
                            ToolResult::fail("no element matches selector")
                        }
                    })
                    .await
                } else {
                    let text = text.to_string();
                    let outcome = self
                        .host
                        .with_session(|session| {
                            Box::pin(async move {
                                session
                                    .call(
                                        "Input.insertText",
                                        serde_json::json!({ "text": text }),
                                    )
                                    .await
                            })
                        })
                        .await;
                    match outcome {
                        Ok(_) => ToolResult::ok("typed into focused element"),
                        Err(e) => ToolResult::fail(e),
                    }
                }
            }
            "evaluate" => {
                let Some(expression) = args.get("expression").and_then(|v| v.as_str()) else {
                    return ToolResult::fail("browser evaluate requires 'expression'");
                };
                self.run_js(expression, |value| {
                    ToolResult::ok(
                        serde_json::to_string(&value).unwrap_or_else(|_| "null".into()),
                    )
                })
                .await
            }
            "content" => {
                self.run_js("document.documentElement.outerHTML", |value| {
                    let mut html = value.as_str().unwrap_or("").to_string();
                    if html.len() > CONTENT_CAP {
                        let total = html.len();
                        html.truncate(CONTENT_CAP);
                        html.push_str(&format!("... [truncated, {total} bytes total]"));
                    }
                    ToolResult::ok(html)
                })
                .await
            }
            other => ToolResult::fail(format!("unknown browser action: {other}")),
        }
    }
}

impl BrowserTool {
    async fn run_js(
        &self,
        expression: &str,
        shape: impl FnOnce(serde_json::Value) -> ToolResult,
    ) -> ToolResult {
        let expression = expression.to_string();
        let outcome = self
            .host
            .with_session(|session| {
                Box::pin(async move { session.evaluate(&expression).await })
            })
            .await;
        match outcome {
            Ok(value) => shape(value),
            Err(e) => ToolResult::fail(e),
        }
    }
}
