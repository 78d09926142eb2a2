// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::debug;

use jarvis_auth::{AuditKind, AuditRecord};

use crate::builtin::ToolContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Commands whose first word matches this list are refused outright.  The
/// sandbox protects files; this protects the host from the obvious
/// foot-guns a confused model reaches for.
const DENY_COMMANDS: &[&str] = &[
    "shutdown", "reboot", "halt", "poweroff", "mkfs", "dd", "init",
];

pub struct ShellTool {
    ctx: ToolContext,
}

impl ShellTool {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the agent workspace and return its output.\n\
         Commands run under `sh -c` with the workspace as working directory.\n\
         Default timeout 120 s (override with timeout_secs, max 600).\n\
         Output is capped at 256 KiB."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command line to run" },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Wall-clock limit in seconds (default 120, max 600)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn timeout(&self) -> Duration {
        // The registry deadline sits above the per-call limit below.
        Duration::from_secs(610)
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(command) = call.args.get("command").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'command'");
        };
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(|s| Duration::from_secs(s.min(600)))
            .unwrap_or(DEFAULT_TIMEOUT);

        let first_word = command.split_whitespace().next().unwrap_or("");
        if DENY_COMMANDS.contains(&first_word) {
            self.ctx.audit.record(
                AuditRecord::new(
                    AuditKind::BlockedCommand,
                    "shell",
                    json!({ "command": command }),
                )
                .with_agent(&self.ctx.agent_id),
            );
            return ToolOutput::err(&call.id, format!("command blocked: {first_word}"));
        }

        debug!(command, "shell tool");
        let mut child = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.ctx.sandbox.workspace())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("spawn failed: {e}")),
        };

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let result = tokio::time::timeout(timeout, async {
            let mut out_buf = Vec::new();
            let mut err_buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut out_buf).await;
            }
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_end(&mut err_buf).await;
            }
            let status = child.wait().await;
            (status, out_buf, err_buf)
        })
        .await;

        match result {
            Err(_) => ToolOutput::err(&call.id, format!("command timed out after {timeout:?}")),
            Ok((Err(e), _, _)) => ToolOutput::err(&call.id, format!("wait failed: {e}")),
            Ok((Ok(status), out_buf, err_buf)) => {
                let mut text = String::from_utf8_lossy(&out_buf).into_owned();
                if !err_buf.is_empty() {
                    text.push_str("\n--- stderr ---\n");
                    text.push_str(&String::from_utf8_lossy(&err_buf));
                }
                if text.len() > MAX_OUTPUT_BYTES {
                    text.truncate(MAX_OUTPUT_BYTES);
                    text.push_str("\n...[output truncated]");
                }
                if status.success() {
                    ToolOutput::ok(&call.id, text)
                } else {
                    ToolOutput::err(
                        &call.id,
                        format!("exit status {status}\n{text}"),
                    )
                }
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
