//! Web tool: HTTP requests with SSRF hardening — scheme and port checks,
//! private/loopback address rejection, header stripping and a response
//! body cap.

use std::net::{IpAddr, ToSocketAddrs};
use url::Url;

use super::{Tool, ToolContext, ToolResult};

const BODY_CAP: usize = 128 * 1024;
/// Ports that are never fetched (SSH, SMTP, databases, ...).
const BLOCKED_PORTS: [u16; 10] = [22, 23, 25, 465, 587, 3306, 5432, 6379, 9200, 27017];
/// Request headers the model may not set.
const STRIPPED_HEADERS: [&str; 6] =
    ["authorization", "cookie", "proxy-authorization", "host", "transfer-encoding", "connection"];

fn ip_is_forbidden(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Validate scheme, port and destination address. The host is resolved so
/// DNS names pointing into private ranges are caught too.
pub(crate) fn validate_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("scheme {:?} not allowed, use http/https", url.scheme()));
    }
    let host = url.host_str().ok_or("URL must include a host")?.to_lowercase();
    if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
        return Err("local hosts are not allowed".into());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    if BLOCKED_PORTS.contains(&port) {
        return Err(format!("port {port} is blocked"));
    }

    // Literal IP or resolved addresses must not land in forbidden ranges.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip_is_forbidden(ip) {
            return Err("private/loopback addresses are not allowed".into());
        }
    } else if let Ok(addrs) = (host.as_str(), port).to_socket_addrs() {
        for addr in addrs {
            if ip_is_forbidden(addr.ip()) {
                return Err(format!("host {host} resolves to a forbidden address"));
            }
        }
    }
    Ok(url)
}

pub struct WebTool {
    client: reqwest::Client,
}

impl WebTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(5))
                .build()
                .expect("reqwest client"),
        }
    }
}

impl Default for WebTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for WebTool {
    fn name(&self) -> &str {
        "web"
    }

    fn description(&self) -> &str {
        "HTTP request (GET/POST) against a public URL; returns status and body"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "enum": ["GET", "POST"], "default": "GET" },
                "body": { "type": "string", "description": "Request body for POST" },
                "headers": { "type": "object", "description": "Extra request headers" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(raw_url) = args.get("url").and_then(|v| v.as_str()) else {
            return ToolResult::fail("web requires a 'url' argument");
        };
        let url = match validate_url(raw_url) {
            Ok(url) => url,
            Err(e) => return ToolResult::fail(e),
        };

        let method = args.get("method").and_then(|v| v.as_str()).unwrap_or("GET").to_uppercase();
        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            other => return ToolResult::fail(format!("method {other} not allowed")),
        };

        if let Some(headers) = args.get("headers").and_then(|v| v.as_object()) {
            for (key, value) in headers {
                if STRIPPED_HEADERS.contains(&key.to_lowercase().as_str()) {
                    tracing::debug!(header = %key, "stripped disallowed request header");
                    continue;
                }
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }
        if let Some(body) = args.get("body").and_then(|v| v.as_str()) {
            request = request.body(body.to_string());
        }

        let timeout = std::time::Duration::from_millis(ctx.config.tool_timeout_ms);
        let response = match request.timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::fail(format!("request failed: {e}")),
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::fail(format!("failed to read body: {e}")),
        };
        let mut body = body;
        if body.len() > BODY_CAP {
            let total = body.len();
            body.truncate(BODY_CAP);
            body.push_str(&format!("... [truncated, {total} bytes total]"));
        }

        let output = format!("HTTP {} ({content_type})\n{body}", status.as_u16());
        if status.is_success() {
            ToolResult::ok(output)
        } else {
            ToolResult {
                success: false,
                output,
                error: Some(format!("HTTP status {}", status.as_u16())),
                ..Default::default()
            }
        }
    }
}
