// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// `true` when the tool failed non-fatally; the agent loop feeds the
    /// message back to the model instead of aborting.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Trait every built-in and plugin-registered tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object.
    fn input_schema(&self) -> Value;
    /// Per-call wall-clock limit enforced by the registry.
    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }
    /// Execute the call.  Failures are wrapped in [`ToolOutput::err`]; a
    /// returned error never aborts the agent loop.
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NopTool;

    #[async_trait]
    impl Tool for NopTool {
        fn name(&self) -> &str {
            "nop"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "done")
        }
    }

    #[test]
    fn default_timeout_is_two_minutes() {
        assert_eq!(NopTool.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn outputs_carry_error_flag() {
        assert!(!ToolOutput::ok("1", "x").is_error);
        assert!(ToolOutput::err("1", "x").is_error);
    }
}
