// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use jarvis_auth::{AuditKind, AuditRecord};

use crate::builtin::ToolContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

const MAX_READ_BYTES: u64 = 1024 * 1024;

pub struct ReadFileTool {
    ctx: ToolContext,
}

impl ReadFileTool {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the agent workspace or shared storage.\n\
         Paths resolve relative to the workspace; access outside the sandbox\n\
         is refused.  Files larger than 1 MiB are refused."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to read" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(raw) = call.args.get("path").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'path'");
        };
        let path = match self.ctx.sandbox.resolve_read(raw) {
            Ok(p) => p,
            Err(e) => {
                // Record the denial before the model hears about it.
                self.ctx.audit.record(
                    AuditRecord::new(
                        AuditKind::BlockedPath,
                        "read_file",
                        json!({ "path": raw, "reason": e.to_string() }),
                    )
                    .with_agent(&self.ctx.agent_id),
                );
                return ToolOutput::err(&call.id, e.to_string());
            }
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > MAX_READ_BYTES => {
                return ToolOutput::err(
                    &call.id,
                    format!("file too large ({} bytes, max {MAX_READ_BYTES})", meta.len()),
                )
            }
            Err(e) => return ToolOutput::err(&call.id, format!("{raw}: {e}")),
            _ => {}
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => ToolOutput::ok(&call.id, content),
            Err(e) => ToolOutput::err(&call.id, format!("{raw}: {e}")),
        }
    }
}

pub struct WriteFileTool {
    ctx: ToolContext,
}

impl WriteFileTool {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file inside the agent workspace or shared storage.\n\
         Parent directories are created.  Package manifests, version-control\n\
         internals, and vendor trees are refused."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to write" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(raw) = call.args.get("path").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'path'");
        };
        let Some(content) = call.args.get("content").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'content'");
        };
        let path = match self.ctx.sandbox.resolve_write(raw) {
            Ok(p) => p,
            Err(e) => {
                self.ctx.audit.record(
                    AuditRecord::new(
                        AuditKind::BlockedPath,
                        "write_file",
                        json!({ "path": raw, "reason": e.to_string() }),
                    )
                    .with_agent(&self.ctx.agent_id),
                );
                return ToolOutput::err(&call.id, e.to_string());
            }
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("{raw}: {e}"));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("wrote {} bytes to {raw}", content.len())),
            Err(e) => ToolOutput::err(&call.id, format!("{raw}: {e}")),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
