// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Payloads exchanged on the coordination subjects.
//!
//! Delivery over the bus is at-least-once, so every consumer of these types
//! must be idempotent: discovery and heartbeats are naturally last-write-wins,
//! delegation requests carry an id the hub deduplicates on.

use serde::{Deserialize, Serialize};

use crate::model::{AgentRole, AgentStatus, TaskPriority, TaskStatus, Usage};

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Published on `jarvis.agents.discovery` at startup (`online`) and shutdown
/// (`offline`).  The hub snapshots peers and rebroadcasts the roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Discovery {
    pub agent_id: String,
    pub role: AgentRole,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// `"online"` or `"offline"`.
    pub status: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

// ── Heartbeats ────────────────────────────────────────────────────────────────

/// Published on the agent's heartbeat subject every heartbeat interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    /// Sender-side milliseconds since epoch; the hub stamps its own clock on
    /// receipt and uses only that for timeout sweeps.
    pub sent_at_ms: i64,
}

// ── Inter-agent messaging ─────────────────────────────────────────────────────

/// Kind of an inter-agent message.  `Task` and `Delegation` route to the
/// coordination request subject; the rest go directly to the recipient's DM
/// subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMessageKind {
    Task,
    Delegation,
    Query,
    Notification,
    Result,
    /// A heartbeat poll with no attention-worthy content; the recipient's
    /// model may answer with the literal `HEARTBEAT_OK`.
    HeartbeatPoll,
}

/// A direct message between agents (`jarvis.agent.<to>.dm`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: AgentMessageKind,
    pub content: String,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
}

fn default_priority() -> TaskPriority {
    TaskPriority::Normal
}

// ── Delegation ────────────────────────────────────────────────────────────────

/// Published on `jarvis.coordination.request` when an agent delegates work.
/// The hub admits it as a task and schedules it like any client-created one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegationRequest {
    /// Requester-generated id, used by the hub for at-least-once dedup and by
    /// `check_delegated_task` for follow-up.
    pub id: String,
    pub from: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// Request on `jarvis.coordination.response`: status of a delegated task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowUpQuery {
    pub delegation_id: String,
}

/// Reply to a [`FollowUpQuery`], answered by the hub from task state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowUpReply {
    pub delegation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
}

// ── Task lifecycle events ─────────────────────────────────────────────────────

/// Published on `jarvis.agent.<id>.result` when a task terminates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    pub session_id: String,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_round_trip() {
        let d = Discovery {
            agent_id: "dev-1".into(),
            role: AgentRole::Dev,
            host: "workstation".into(),
            ip: Some("10.0.0.5".into()),
            status: "online".into(),
            capabilities: vec!["code".into()],
        };
        let back: Discovery =
            serde_json::from_str(&serde_json::to_string(&d).unwrap()).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn agent_message_kind_uses_type_field() {
        let m = AgentMessage {
            id: "m1".into(),
            from: "orchestrator-1".into(),
            to: "dev-1".into(),
            kind: AgentMessageKind::Query,
            content: "status?".into(),
            priority: TaskPriority::Normal,
        };
        let text = serde_json::to_string(&m).unwrap();
        assert!(text.contains("\"type\":\"query\""));
    }

    #[test]
    fn agent_message_priority_defaults_to_normal() {
        let m: AgentMessage = serde_json::from_str(
            r#"{"id":"1","from":"a","to":"b","type":"notification","content":"x"}"#,
        )
        .unwrap();
        assert_eq!(m.priority, TaskPriority::Normal);
    }

    #[test]
    fn delegation_request_round_trip() {
        let d = DelegationRequest {
            id: "d1".into(),
            from: "orchestrator-1".into(),
            title: "ship it".into(),
            description: String::new(),
            priority: TaskPriority::High,
            required_capabilities: vec!["code".into()],
        };
        let back: DelegationRequest =
            serde_json::from_str(&serde_json::to_string(&d).unwrap()).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn follow_up_reply_for_unknown_delegation_is_sparse() {
        let r = FollowUpReply {
            delegation_id: "d9".into(),
            task_id: None,
            status: None,
            assigned_agent: None,
            result_summary: None,
        };
        let text = serde_json::to_string(&r).unwrap();
        assert_eq!(text, r#"{"delegation_id":"d9"}"#);
    }
}
