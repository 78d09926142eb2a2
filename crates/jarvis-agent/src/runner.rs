// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The reasoning loop: one task in, a streamed model ↔ tool conversation,
//! one terminal result out.
//!
//! Tool errors never abort the loop — they return to the model as error
//! results.  Provider errors ride the failover chain; only when every model
//! fails does the task fail.  Each task is bounded by a wall-clock budget and
//! a token budget; exceeding either fails the task with `budget_exceeded`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info, warn};

use jarvis_bus::BusClient;
use jarvis_config::AgentConfig;
use jarvis_model::{
    ChatChunk, ChatRequest, ChunkStream, ProviderRegistry, StopReason, ToolSpec, UsageAccumulator,
};
use jarvis_plugin::{HookContext, HookEvent, PluginHost};
use jarvis_proto::{
    coordination::TaskResult, subjects, AgentMessage, AgentMessageKind, ContentBlock, Discovery,
    Message, SessionEntry, Task, TaskStatus, Usage,
};
use jarvis_session::{restore_messages, Journal};
use jarvis_tools::{ToolCall, ToolRegistry};

use crate::events::ProgressEvent;
use crate::prompts::{self, PromptInputs, HEARTBEAT_OK, NO_REPLY};

/// Everything a task run needs, shared across the runtime.
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub bus: BusClient,
    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub plugins: Arc<PluginHost>,
    pub sessions_dir: PathBuf,
    /// Peer roster, refreshed from hub broadcasts.
    pub peers: Arc<RwLock<Vec<Discovery>>>,
    /// DMs received while a task was running; injected as user turns at the
    /// next loop iteration.
    pub inbox: Arc<Mutex<Vec<AgentMessage>>>,
}

/// Terminal result of one task run.
#[derive(Debug)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub usage: Usage,
    pub session_id: String,
}

struct PendingUse {
    id: String,
    name: String,
    arguments: String,
}

/// Run one task to a terminal state and publish the result event.
pub async fn run_task(ctx: &AgentContext, task: &Task) -> TaskOutcome {
    let mut journal = match Journal::create(&ctx.sessions_dir, &ctx.config.id, Some(&task.id)) {
        Ok(j) => j,
        Err(e) => {
            return finish(
                ctx,
                task,
                String::new(),
                Err(format!("session create failed: {e}")),
                Usage::default(),
            )
            .await;
        }
    };
    let session_id = journal.id().to_string();
    let hook_ctx = HookContext {
        agent_id: ctx.config.id.clone(),
        session_id: Some(session_id.clone()),
        config: json!({ "role": ctx.config.role }),
    };

    ctx.plugins
        .emit(
            &HookEvent::SessionStart {
                session_id: session_id.clone(),
            },
            &hook_ctx,
        )
        .await;
    ctx.plugins
        .emit(&HookEvent::TaskAssigned { task: task.clone() }, &hook_ctx)
        .await;

    let opening = format!("Task: {}\n\n{}", task.title, task.description);
    if let Err(e) = journal.append(SessionEntry::Message {
        role: jarvis_proto::Role::User,
        content: jarvis_proto::MessageContent::Text(opening),
    }) {
        return finish(ctx, task, session_id, Err(format!("journal: {e}")), Usage::default())
            .await;
    }

    let deadline = Instant::now() + Duration::from_secs(ctx.config.budget.wall_clock_secs);
    let mut acc = UsageAccumulator::new();
    let mut rounds = 0u32;
    let mut final_text = String::new();

    let failure: Option<String> = loop {
        rounds += 1;
        if rounds > ctx.config.budget.max_tool_rounds {
            break Some("budget_exceeded: tool-round budget".into());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Some("budget_exceeded: wall clock".into());
        }

        // DMs that arrived mid-task surface as user turns before the next
        // model call.
        for dm in ctx.inbox.lock().expect("inbox lock").drain(..) {
            let _ = journal.append(SessionEntry::Message {
                role: jarvis_proto::Role::User,
                content: jarvis_proto::MessageContent::Text(format!(
                    "[message from {} ({:?})] {}",
                    dm.from, dm.kind, dm.content
                )),
            });
        }

        let records = match journal.records() {
            Ok(r) => r,
            Err(e) => break Some(format!("journal read failed: {e}")),
        };
        let req = ChatRequest {
            model: ctx.config.model.primary.clone(),
            messages: restore_messages(&records),
            system: Some(self::task_system_prompt(ctx, Some(task))),
            tools: tool_specs(&ctx.tools),
            temperature: Some(ctx.config.model.temperature),
            max_output_tokens: Some(ctx.config.model.max_output_tokens),
            stop_sequences: Vec::new(),
            stream: true,
        };

        let opened = tokio::time::timeout(
            remaining,
            ctx.providers
                .chat_stream_with_failover(req, &ctx.config.model.fallbacks),
        )
        .await;
        let (model, stream) = match opened {
            Err(_) => break Some("budget_exceeded: wall clock".into()),
            Ok(Err(e)) => break Some(format!("provider_error: {e:#}")),
            Ok(Ok(pair)) => pair,
        };
        debug!(model = %model, round = rounds, "streaming model turn");

        let remaining = deadline.saturating_duration_since(Instant::now());
        let consumed =
            tokio::time::timeout(remaining, consume_stream(ctx, &task.id, stream)).await;
        let (text, uses, stop_reason, usage) = match consumed {
            Err(_) => break Some("budget_exceeded: wall clock".into()),
            Ok(Err(e)) => break Some(format!("provider_error: {e:#}")),
            Ok(Ok(turn)) => turn,
        };

        // Journal the assistant turn exactly as the model produced it.
        let entry = if uses.is_empty() {
            SessionEntry::Message {
                role: jarvis_proto::Role::Assistant,
                content: jarvis_proto::MessageContent::Text(text.clone()),
            }
        } else {
            let mut blocks = Vec::new();
            if !text.is_empty() {
                blocks.push(ContentBlock::text(text.clone()));
            }
            for u in &uses {
                let input = serde_json::from_str(&u.arguments)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                blocks.push(ContentBlock::tool_use(&u.id, &u.name, input));
            }
            SessionEntry::Message {
                role: jarvis_proto::Role::Assistant,
                content: jarvis_proto::MessageContent::Blocks(blocks),
            }
        };
        if let Err(e) = journal.append(entry) {
            break Some(format!("journal: {e}"));
        }
        let _ = journal.append(SessionEntry::Usage { usage });
        acc.merge(&usage);
        publish_progress(
            ctx,
            &ProgressEvent::TokenUsage {
                task_id: task.id.clone(),
                usage: acc.total(),
            },
            &task.id,
        )
        .await;
        ctx.plugins
            .emit(&HookEvent::LlmOutput { text: text.clone() }, &hook_ctx)
            .await;

        if acc.total().total_tokens > ctx.config.budget.total_tokens {
            break Some("budget_exceeded: token budget".into());
        }

        if stop_reason != StopReason::ToolUse || uses.is_empty() {
            if stop_reason == StopReason::MaxTokens {
                // The session is preserved; the loop just cannot continue the
                // truncated turn.
                final_text = text;
                break Some("max_tokens".into());
            }
            final_text = text;
            break None;
        }

        for u in uses {
            run_one_tool(ctx, task, &mut journal, &hook_ctx, u).await;
        }
        // Opportunistic compaction keeps long sessions inside the context
        // window without a separate maintenance pass.
        if let Err(e) = journal.compact() {
            warn!("compaction failed: {e}");
        }
    };

    ctx.plugins
        .emit(
            &HookEvent::SessionEnd {
                session_id: session_id.clone(),
            },
            &hook_ctx,
        )
        .await;

    let result = match failure {
        None => Ok(final_text),
        Some(e) => Err(e),
    };
    finish(ctx, task, session_id, result, acc.total()).await
}

async fn run_one_tool(
    ctx: &AgentContext,
    task: &Task,
    journal: &mut Journal,
    hook_ctx: &HookContext,
    pending: PendingUse,
) {
    let input: serde_json::Value = serde_json::from_str(&pending.arguments)
        .unwrap_or(serde_json::Value::Object(Default::default()));
    ctx.plugins
        .emit(
            &HookEvent::BeforeToolCall {
                tool: pending.name.clone(),
                call_id: pending.id.clone(),
                input: input.clone(),
            },
            hook_ctx,
        )
        .await;
    let _ = journal.append(SessionEntry::ToolCall {
        tool: pending.name.clone(),
        call_id: pending.id.clone(),
        input: input.clone(),
    });
    publish_progress(
        ctx,
        &ProgressEvent::ToolCallStarted {
            task_id: task.id.clone(),
            call_id: pending.id.clone(),
            tool: pending.name.clone(),
        },
        &task.id,
    )
    .await;

    let started = Instant::now();
    let output = ctx
        .tools
        .execute(&ToolCall {
            id: pending.id.clone(),
            name: pending.name.clone(),
            args: input,
        })
        .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let _ = journal.append(SessionEntry::ToolResult {
        call_id: pending.id.clone(),
        content: output.content.clone().into(),
        is_error: output.is_error,
    });
    publish_progress(
        ctx,
        &ProgressEvent::ToolCallFinished {
            task_id: task.id.clone(),
            call_id: pending.id.clone(),
            tool: pending.name.clone(),
            is_error: output.is_error,
            duration_ms,
        },
        &task.id,
    )
    .await;
    ctx.plugins
        .emit(
            &HookEvent::AfterToolCall {
                tool: pending.name,
                call_id: pending.id,
                output: output.content,
                is_error: output.is_error,
                duration_ms,
            },
            hook_ctx,
        )
        .await;
}

/// Decode one model turn from the chunk stream, emitting streaming progress.
async fn consume_stream(
    ctx: &AgentContext,
    task_id: &str,
    mut stream: ChunkStream,
) -> anyhow::Result<(String, Vec<PendingUse>, StopReason, Usage)> {
    let mut text = String::new();
    let mut uses = Vec::new();
    let mut stop_reason = StopReason::EndTurn;
    let mut usage = Usage::default();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            ChatChunk::TextDelta(delta) => {
                publish_progress(
                    ctx,
                    &ProgressEvent::TextDelta {
                        task_id: task_id.to_string(),
                        delta: delta.clone(),
                    },
                    task_id,
                )
                .await;
                text.push_str(&delta);
            }
            // Start/delta chunks are display-only; the end chunk carries the
            // full argument string.
            ChatChunk::ToolUseStart { .. } | ChatChunk::ToolUseDelta { .. } => {}
            ChatChunk::ToolUseEnd {
                id,
                name,
                arguments,
                ..
            } => uses.push(PendingUse {
                id,
                name,
                arguments,
            }),
            ChatChunk::MessageEnd {
                stop_reason: sr,
                usage: u,
            } => {
                stop_reason = sr;
                usage = u;
            }
            ChatChunk::Error(e) => anyhow::bail!("stream error: {e}"),
        }
    }
    Ok((text, uses, stop_reason, usage))
}

async fn finish(
    ctx: &AgentContext,
    task: &Task,
    session_id: String,
    result: Result<String, String>,
    usage: Usage,
) -> TaskOutcome {
    let hook_ctx = HookContext {
        agent_id: ctx.config.id.clone(),
        session_id: Some(session_id.clone()),
        config: json!({}),
    };
    let outcome = match result {
        Ok(summary) => {
            info!(task = %task.id, "task completed");
            ctx.plugins
                .emit(
                    &HookEvent::TaskCompleted {
                        task_id: task.id.clone(),
                    },
                    &hook_ctx,
                )
                .await;
            TaskOutcome {
                status: TaskStatus::Completed,
                summary: Some(summary),
                error: None,
                usage,
                session_id,
            }
        }
        Err(error) => {
            warn!(task = %task.id, error = %error, "task failed");
            ctx.plugins
                .emit(
                    &HookEvent::TaskFailed {
                        task_id: task.id.clone(),
                        error: error.clone(),
                    },
                    &hook_ctx,
                )
                .await;
            TaskOutcome {
                status: TaskStatus::Failed,
                summary: None,
                error: Some(error),
                usage,
                session_id,
            }
        }
    };

    let result_event = TaskResult {
        task_id: task.id.clone(),
        agent_id: ctx.config.id.clone(),
        status: outcome.status,
        summary: outcome.summary.clone(),
        error: outcome.error.clone(),
        usage: outcome.usage,
        session_id: outcome.session_id.clone(),
    };
    if let Err(e) = ctx
        .bus
        .publish_json(&subjects::agent_result(&ctx.config.id), &result_event)
        .await
    {
        warn!("result publish failed: {e}");
    }
    publish_progress(
        ctx,
        &ProgressEvent::TurnComplete {
            task_id: task.id.clone(),
        },
        &task.id,
    )
    .await;
    outcome
}

/// Answer one direct message with a single tool-free model turn.
///
/// Returns the reply to send back, or `None` when the model short-circuits
/// with the `HEARTBEAT_OK` / `NO_REPLY` literals (the runtime then sends
/// nothing at all).
pub async fn run_dm_turn(ctx: &AgentContext, dm: &AgentMessage) -> Option<AgentMessage> {
    let hook_ctx = HookContext {
        agent_id: ctx.config.id.clone(),
        session_id: None,
        config: json!({}),
    };
    ctx.plugins
        .emit(
            &HookEvent::MessageReceived {
                from: dm.from.clone(),
                content: dm.content.clone(),
            },
            &hook_ctx,
        )
        .await;

    let user_text = match dm.kind {
        AgentMessageKind::HeartbeatPoll => format!(
            "[heartbeat poll from {}] {}\n\nIf nothing needs attention, reply \
             with exactly {HEARTBEAT_OK}.",
            dm.from, dm.content
        ),
        _ => format!("[message from {} ({:?})] {}", dm.from, dm.kind, dm.content),
    };

    let req = ChatRequest {
        model: ctx.config.model.primary.clone(),
        messages: vec![Message::user(user_text)],
        system: Some(task_system_prompt(ctx, None)),
        tools: Vec::new(),
        temperature: Some(ctx.config.model.temperature),
        max_output_tokens: Some(ctx.config.model.max_output_tokens),
        stop_sequences: Vec::new(),
        stream: false,
    };
    let response = match ctx
        .providers
        .chat_with_failover(req, &ctx.config.model.fallbacks)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(from = %dm.from, "dm turn failed: {e:#}");
            return None;
        }
    };

    let text = response.text();
    let trimmed = text.trim();
    if trimmed == HEARTBEAT_OK || trimmed == NO_REPLY {
        debug!(from = %dm.from, literal = %trimmed, "dm short-circuited");
        return None;
    }
    Some(AgentMessage {
        id: uuid::Uuid::new_v4().to_string(),
        from: ctx.config.id.clone(),
        to: dm.from.clone(),
        kind: AgentMessageKind::Result,
        content: text,
        priority: dm.priority,
    })
}

fn task_system_prompt(ctx: &AgentContext, task: Option<&Task>) -> String {
    let peers = ctx.peers.read().expect("peer lock").clone();
    let inputs = PromptInputs {
        agent_id: &ctx.config.id,
        host_label: &ctx.config.host_label,
        peers: &peers,
        sections: ctx.plugins.prompt_sections(),
        task,
    };
    prompts::system_prompt(ctx.config.role, &inputs)
}

fn tool_specs(tools: &ToolRegistry) -> Vec<ToolSpec> {
    tools
        .schemas()
        .into_iter()
        .map(|s| ToolSpec {
            name: s.name,
            description: s.description,
            input_schema: s.input_schema,
        })
        .collect()
}

async fn publish_progress(ctx: &AgentContext, event: &ProgressEvent, task_id: &str) {
    if let Err(e) = ctx
        .bus
        .publish_json(&subjects::task_progress(task_id), event)
        .await
    {
        debug!("progress publish failed: {e}");
    }
}
