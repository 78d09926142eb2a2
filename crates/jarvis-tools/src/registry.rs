// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::ratelimit::RateLimiter;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// A tool schema as handed to the model layer.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Reroute one tool through a transport bridge with the same contract
/// (e.g. shell execution forwarded to a remote host).
#[derive(Debug, Clone)]
pub struct RouteOverride {
    /// Name of the bridging tool that carries the call.
    pub bridge: String,
    /// Remote host the bridge should target.
    pub host: String,
}

/// Central registry holding every available tool.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    overrides: HashMap<String, RouteOverride>,
    limiter: Option<RateLimiter>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            overrides: HashMap::new(),
            limiter: None,
        }
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Route `tool` through `bridge` targeting `host`.  The bridge must be
    /// registered by the time calls arrive.
    pub fn set_route_override(&mut self, tool: &str, bridge: &str, host: &str) {
        self.overrides.insert(
            tool.to_string(),
            RouteOverride {
                bridge: bridge.to_string(),
                host: host.to_string(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for every registered tool, name-sorted for a stable prompt.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute a call: apply the rate limit, apply any route override, look
    /// the tool up, and bound it with the tool's timeout.  Every failure mode
    /// comes back as an error [`ToolOutput`] — never a panic or an abort.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire(&call.name) {
                warn!(tool = %call.name, "tool call rate limited");
                return ToolOutput::err(
                    &call.id,
                    format!("rate limited: too many {} calls, retry later", call.name),
                );
            }
        }

        // Route overrides rewrite the call onto the bridge, preserving the
        // original contract under `tool`/`args` plus the target host.
        let rewritten;
        let effective: &ToolCall = match self.overrides.get(&call.name) {
            Some(route) => {
                debug!(tool = %call.name, bridge = %route.bridge, host = %route.host,
                       "routing tool call through bridge");
                rewritten = ToolCall {
                    id: call.id.clone(),
                    name: route.bridge.clone(),
                    args: json!({
                        "host": route.host,
                        "tool": call.name,
                        "args": call.args,
                    }),
                };
                &rewritten
            }
            None => call,
        };

        let Some(tool) = self.tools.get(&effective.name) else {
            return ToolOutput::err(&call.id, format!("unknown tool: {}", effective.name));
        };

        match tokio::time::timeout(tool.timeout(), tool.execute(effective)).await {
            Ok(output) => output,
            Err(_) => ToolOutput::err(
                &call.id,
                format!(
                    "tool {} timed out after {:?}",
                    effective.name,
                    tool.timeout()
                ),
            ),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
