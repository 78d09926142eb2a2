// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use jarvis_proto::Task;

/// The named extension points of the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    AgentStart,
    AgentEnd,
    SessionStart,
    SessionEnd,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    BeforeToolCall,
    AfterToolCall,
    LlmOutput,
    MessageReceived,
}

/// Typed payload delivered to hook handlers.
#[derive(Debug, Clone)]
pub enum HookEvent {
    AgentStart,
    AgentEnd,
    SessionStart {
        session_id: String,
    },
    SessionEnd {
        session_id: String,
    },
    TaskAssigned {
        task: Task,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    BeforeToolCall {
        tool: String,
        call_id: String,
        input: Value,
    },
    AfterToolCall {
        tool: String,
        call_id: String,
        output: String,
        is_error: bool,
        duration_ms: u64,
    },
    LlmOutput {
        text: String,
    },
    MessageReceived {
        from: String,
        content: String,
    },
}

impl HookEvent {
    /// The hook this event fires on.
    pub fn hook(&self) -> Hook {
        match self {
            HookEvent::AgentStart => Hook::AgentStart,
            HookEvent::AgentEnd => Hook::AgentEnd,
            HookEvent::SessionStart { .. } => Hook::SessionStart,
            HookEvent::SessionEnd { .. } => Hook::SessionEnd,
            HookEvent::TaskAssigned { .. } => Hook::TaskAssigned,
            HookEvent::TaskCompleted { .. } => Hook::TaskCompleted,
            HookEvent::TaskFailed { .. } => Hook::TaskFailed,
            HookEvent::BeforeToolCall { .. } => Hook::BeforeToolCall,
            HookEvent::AfterToolCall { .. } => Hook::AfterToolCall,
            HookEvent::LlmOutput { .. } => Hook::LlmOutput,
            HookEvent::MessageReceived { .. } => Hook::MessageReceived,
        }
    }
}

/// Ambient context handed to every handler alongside the event.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub agent_id: String,
    pub session_id: Option<String>,
    /// Plugin-visible slice of the agent configuration.
    pub config: Value,
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: &HookEvent, ctx: &HookContext) -> anyhow::Result<()>;
}

/// Adapter for plain closures (tests, small plugins).
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(&HookEvent, &HookContext) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &HookEvent, ctx: &HookContext) -> anyhow::Result<()> {
        (self.0)(event, ctx)
    }
}

/// Dispatches events to handlers in registration order.  A handler error is
/// logged and swallowed — one broken plugin must not take the emitter down,
/// and the bus's at-least-once delivery means handlers can see duplicates
/// anyway.
#[derive(Default)]
pub struct HookRunner {
    handlers: HashMap<Hook, Vec<(String, Arc<dyn HookHandler>)>>,
}

impl HookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin_id: &str, hook: Hook, handler: Arc<dyn HookHandler>) {
        self.handlers
            .entry(hook)
            .or_default()
            .push((plugin_id.to_string(), handler));
    }

    pub fn handler_count(&self, hook: Hook) -> usize {
        self.handlers.get(&hook).map_or(0, Vec::len)
    }

    pub async fn emit(&self, event: &HookEvent, ctx: &HookContext) {
        let Some(handlers) = self.handlers.get(&event.hook()) else {
            return;
        };
        for (plugin_id, handler) in handlers {
            if let Err(e) = handler.handle(event, ctx).await {
                warn!(plugin = %plugin_id, hook = ?event.hook(), "hook handler failed: {e}");
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
