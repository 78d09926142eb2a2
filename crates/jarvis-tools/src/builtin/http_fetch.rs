// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use jarvis_auth::{AuditKind, AuditRecord};

use crate::builtin::ToolContext;
use crate::ssrf::check_url;
use crate::tool::{Tool, ToolCall, ToolOutput};

const DEFAULT_MAX_CHARS: usize = 50_000;

pub struct HttpFetchTool {
    ctx: ToolContext,
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new(ctx: ToolContext) -> Self {
        // Redirects disabled: a public URL answering with a 302 to
        // 169.254.169.254 would otherwise walk straight around the egress
        // filter.
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent("jarvis-agent/1.0")
            .build()
            .unwrap_or_default();
        Self { ctx, client }
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from a public http(s) URL and return it as text.\n\
         JSON responses are pretty-printed.  Redirects are not followed.\n\
         Localhost, private, and reserved addresses are refused.\n\
         Content is limited to 50,000 characters (configurable via max_chars)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The URL to fetch" },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return (default 50000)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(url) = call.args.get("url").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'url'");
        };
        let max_chars = call
            .args
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_CHARS as u64) as usize;

        // The egress filter runs before any socket is opened, and the denial
        // is audited before the model sees the error.
        if let Err(e) = check_url(url) {
            self.ctx.audit.record(
                AuditRecord::new(
                    AuditKind::BlockedUrl,
                    "http_fetch",
                    json!({ "url": url, "reason": e.to_string() }),
                )
                .with_agent(&self.ctx.agent_id),
            );
            return ToolOutput::err(&call.id, e.to_string());
        }

        debug!(url, "http_fetch");
        match self.fetch(url, max_chars).await {
            Ok(content) => ToolOutput::ok(&call.id, content),
            Err(e) => ToolOutput::err(&call.id, format!("fetch error: {e}")),
        }
    }
}

impl HttpFetchTool {
    async fn fetch(&self, url: &str, max_chars: usize) -> anyhow::Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.is_redirection() {
            anyhow::bail!("redirect responses are not followed ({status})");
        }
        if !status.is_success() {
            anyhow::bail!("upstream returned {status}");
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = response.text().await?;

        let content = if content_type.contains("json") {
            match serde_json::from_str::<Value>(&body) {
                Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
                Err(_) => body,
            }
        } else {
            body
        };

        if content.chars().count() > max_chars {
            let truncated: String = content.chars().take(max_chars).collect();
            Ok(format!(
                "{truncated}...[truncated at {max_chars} chars; total {} chars]",
                content.chars().count()
            ))
        } else {
            Ok(content)
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::PathSandbox;
    use jarvis_auth::AuditLog;
    use std::sync::Arc;

    fn tool() -> (tempfile::TempDir, HttpFetchTool) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            agent_id: "dev-1".into(),
            sandbox: Arc::new(PathSandbox::new(dir.path(), &[])),
            audit: AuditLog::disabled(),
        };
        (dir, HttpFetchTool::new(ctx))
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: "http_fetch".into(),
            args,
        }
    }

    #[tokio::test]
    async fn loopback_is_refused_without_a_socket() {
        let (_dir, t) = tool();
        for url in [
            "http://127.0.0.1:80/",
            "http://2130706433/",
            "http://[::1]/",
            "http://foo.internal/",
        ] {
            let out = t.execute(&call(json!({ "url": url }))).await;
            assert!(out.is_error, "{url} must be blocked");
            assert!(out.content.contains("url blocked"), "{url}: {}", out.content);
        }
    }

    #[tokio::test]
    async fn non_http_scheme_is_refused() {
        let (_dir, t) = tool();
        let out = t.execute(&call(json!({ "url": "file:///etc/passwd" }))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn missing_url_is_a_tool_error() {
        let (_dir, t) = tool();
        assert!(t.execute(&call(json!({}))).await.is_error);
    }
}
