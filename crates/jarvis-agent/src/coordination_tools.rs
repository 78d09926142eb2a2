// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Inter-agent messaging tools.
//!
//! Routing contract: `task` and `delegation` messages become
//! [`DelegationRequest`]s on `jarvis.coordination.request` (the hub admits
//! and schedules them); `query`, `notification`, and `result` go straight to
//! the recipient's DM subject.  `check_delegated_task` asks the hub over the
//! coordination response subject — the orchestrator role is required to call
//! it after delegating.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use jarvis_bus::BusClient;
use jarvis_proto::{
    coordination::{DelegationRequest, FollowUpQuery, FollowUpReply},
    subjects, AgentMessage, AgentMessageKind, TaskPriority,
};
use jarvis_tools::{Tool, ToolCall, ToolOutput};

pub struct MessageAgentTool {
    agent_id: String,
    bus: BusClient,
}

impl MessageAgentTool {
    pub fn new(agent_id: impl Into<String>, bus: BusClient) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
        }
    }
}

#[async_trait]
impl Tool for MessageAgentTool {
    fn name(&self) -> &str {
        "message_agent"
    }

    fn description(&self) -> &str {
        "Send a message to another agent.\n\
         type=task|delegation hands the work to the hub scheduler and returns\n\
         a delegation id for check_delegated_task.\n\
         type=query|notification|result delivers directly to the recipient."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Recipient agent id (ignored for delegation)" },
                "type": {
                    "type": "string",
                    "enum": ["task", "delegation", "query", "notification", "result"]
                },
                "content": { "type": "string" },
                "priority": {
                    "type": "string",
                    "enum": ["low", "normal", "high", "critical"],
                    "description": "Defaults to normal"
                }
            },
            "required": ["to", "type", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(to) = call.args.get("to").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'to'");
        };
        let Some(kind) = call.args.get("type").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'type'");
        };
        let Some(content) = call.args.get("content").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'content'");
        };
        let priority = call
            .args
            .get("priority")
            .and_then(|v| serde_json::from_value::<TaskPriority>(v.clone()).ok())
            .unwrap_or(TaskPriority::Normal);

        match kind {
            "task" | "delegation" => {
                let delegation_id = uuid::Uuid::new_v4().to_string();
                let title = content.lines().next().unwrap_or(content).to_string();
                let request = DelegationRequest {
                    id: delegation_id.clone(),
                    from: self.agent_id.clone(),
                    title,
                    description: content.to_string(),
                    priority,
                    required_capabilities: Vec::new(),
                };
                debug!(delegation = %delegation_id, "publishing delegation request");
                match self
                    .bus
                    .publish_json(subjects::COORDINATION_REQUEST, &request)
                    .await
                {
                    Ok(()) => ToolOutput::ok(
                        &call.id,
                        format!(
                            "delegation submitted (id {delegation_id}); verify progress with \
                             check_delegated_task before reporting completion"
                        ),
                    ),
                    Err(e) => ToolOutput::err(&call.id, format!("bus publish failed: {e}")),
                }
            }
            "query" | "notification" | "result" => {
                let message = AgentMessage {
                    id: uuid::Uuid::new_v4().to_string(),
                    from: self.agent_id.clone(),
                    to: to.to_string(),
                    kind: match kind {
                        "query" => AgentMessageKind::Query,
                        "notification" => AgentMessageKind::Notification,
                        _ => AgentMessageKind::Result,
                    },
                    content: content.to_string(),
                    priority,
                };
                match self
                    .bus
                    .publish_json(&subjects::agent_dm(to), &message)
                    .await
                {
                    Ok(()) => ToolOutput::ok(&call.id, format!("{kind} sent to {to}")),
                    Err(e) => ToolOutput::err(&call.id, format!("bus publish failed: {e}")),
                }
            }
            other => ToolOutput::err(&call.id, format!("unknown message type: {other}")),
        }
    }
}

pub struct CheckDelegatedTaskTool {
    bus: BusClient,
}

impl CheckDelegatedTaskTool {
    pub fn new(bus: BusClient) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for CheckDelegatedTaskTool {
    fn name(&self) -> &str {
        "check_delegated_task"
    }

    fn description(&self) -> &str {
        "Check the status of a previously delegated task.\n\
         Pass the delegation id returned by message_agent."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "delegation_id": { "type": "string" }
            },
            "required": ["delegation_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(delegation_id) = call.args.get("delegation_id").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'delegation_id'");
        };
        let query = FollowUpQuery {
            delegation_id: delegation_id.to_string(),
        };
        let reply: FollowUpReply = match self
            .bus
            .request_json(subjects::COORDINATION_RESPONSE, &query)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ToolOutput::err(&call.id, format!("coordination request failed: {e}"))
            }
        };
        match (&reply.task_id, &reply.status) {
            (Some(task_id), Some(status)) => {
                let mut text = format!(
                    "delegation {delegation_id}: task {task_id} is {status:?}"
                );
                if let Some(agent) = &reply.assigned_agent {
                    text.push_str(&format!(", assigned to {agent}"));
                }
                if let Some(summary) = &reply.result_summary {
                    text.push_str(&format!("\nresult: {summary}"));
                }
                ToolOutput::ok(&call.id, text)
            }
            _ => ToolOutput::err(
                &call.id,
                format!("delegation {delegation_id} is unknown to the hub"),
            ),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
