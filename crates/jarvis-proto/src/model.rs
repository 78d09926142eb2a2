// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// One element of an LLM message.
///
/// Tagged on the wire and in session journals; unknown tags are rejected at
/// decode time rather than silently skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// Base64-encoded image bytes.
        data: String,
        media_type: MediaType,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ContentBlock::Text { text: s.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: ToolResultContent::Text(content.into()),
            is_error: false,
        }
    }
}

/// Image media types accepted on the wire.  Anything else is a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/gif")]
    Gif,
    #[serde(rename = "image/webp")]
    Webp,
}

/// Content of a `tool_result` block — plain text or nested blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Blocks(_) => None,
        }
    }
}

impl From<String> for ToolResultContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResultContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message content — a plain string for the common case, ordered blocks for
/// tool use and multimodal turns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Plain text of this message when it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// All `tool_use` blocks in this message, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.as_str(), name.as_str(), input))
                    }
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    /// Approximate token count (4 chars per token heuristic, images flat).
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::Image { .. } => 765 * 4,
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.len() + input.to_string().len()
                    }
                    ContentBlock::ToolResult { content, .. } => match content {
                        ToolResultContent::Text(t) => t.len(),
                        ToolResultContent::Blocks(inner) => {
                            inner.iter().map(|_| 256usize).sum()
                        }
                    },
                })
                .sum(),
        };
        (chars / 4).max(1)
    }
}

// ─── Token usage ──────────────────────────────────────────────────────────────

/// Token counts from one model turn (or an accumulated scope).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_tokens += other.cache_tokens;
        self.total_tokens += other.total_tokens;
    }
}

// ─── Session journal entries ──────────────────────────────────────────────────

/// One journal entry, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEntry {
    /// Session attributes and compaction markers.
    Meta {
        data: serde_json::Map<String, Value>,
    },
    Message {
        role: Role,
        content: MessageContent,
    },
    ToolCall {
        tool: String,
        call_id: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    Usage {
        #[serde(flatten)]
        usage: Usage,
    },
}

/// One line of a session journal: timestamp + entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalRecord {
    /// Milliseconds since the Unix epoch; monotonic within one journal.
    pub ts: i64,
    #[serde(flatten)]
    pub entry: SessionEntry,
}

impl JournalRecord {
    pub fn now(entry: SessionEntry) -> Self {
        Self {
            ts: Utc::now().timestamp_millis(),
            entry,
        }
    }
}

// ─── Agents ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Orchestrator,
    Dev,
    Marketing,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Dev => "dev",
            AgentRole::Marketing => "marketing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    Offline,
    Starting,
    Idle,
    Busy,
    Error,
    ShuttingDown,
}

/// Who an agent is.  Immutable after registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentIdentity {
    pub id: String,
    pub role: AgentRole,
    pub host: String,
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// The hub's view of one agent.  Mutated only by that agent's heartbeats and
/// task lifecycle events, serialized through the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_description: Option<String>,
    /// Milliseconds since epoch of the last heartbeat seen by the hub.
    pub last_heartbeat_ms: i64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

impl AgentState {
    pub fn new(identity: AgentIdentity) -> Self {
        Self {
            identity,
            status: AgentStatus::Starting,
            current_task_id: None,
            current_task_description: None,
            last_heartbeat_ms: Utc::now().timestamp_millis(),
            completed: 0,
            failed: 0,
        }
    }
}

// ─── Tasks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal lifecycle transition.
    ///
    /// Forward edges follow {pending, queued} → assigned → in-progress →
    /// {completed, failed, cancelled}.  The assigned/in-progress → queued
    /// edges exist only for hub-side reclamation of tasks held by an agent
    /// that went offline; no other writer may take them.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Queued)
                | (Assigned, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (InProgress, Queued)
        )
    }
}

/// A unit of work scheduled by the hub and executed by exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: TaskPriority,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            priority: TaskPriority::Normal,
            required_capabilities: Vec::new(),
            assigned_agent: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            artifacts: Vec::new(),
        }
    }

    /// Apply a transition, enforcing the lifecycle DAG.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal task transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Content blocks ────────────────────────────────────────────────────────

    #[test]
    fn content_block_text_round_trip() {
        let b = ContentBlock::text("hello");
        let text = serde_json::to_string(&b).unwrap();
        assert!(text.contains("\"type\":\"text\""));
        let back: ContentBlock = serde_json::from_str(&text).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn tool_use_round_trip() {
        let b = ContentBlock::tool_use("tu_1", "calculator", json!({"expr": "2+2"}));
        let back: ContentBlock =
            serde_json::from_str(&serde_json::to_string(&b).unwrap()).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn unknown_block_tag_is_rejected() {
        let r: Result<ContentBlock, _> =
            serde_json::from_str(r#"{"type":"audio","data":"x"}"#);
        assert!(r.is_err());
    }

    #[test]
    fn unknown_media_type_is_rejected() {
        let r: Result<ContentBlock, _> = serde_json::from_str(
            r#"{"type":"image","data":"AA==","media_type":"image/tiff"}"#,
        );
        assert!(r.is_err());
    }

    #[test]
    fn media_type_serializes_as_mime() {
        assert_eq!(
            serde_json::to_string(&MediaType::Png).unwrap(),
            "\"image/png\""
        );
    }

    #[test]
    fn tool_result_is_error_defaults_false() {
        let b: ContentBlock = serde_json::from_str(
            r#"{"type":"tool_result","tool_use_id":"u1","content":"ok"}"#,
        )
        .unwrap();
        match b {
            ContentBlock::ToolResult { is_error, .. } => assert!(!is_error),
            _ => panic!("wrong variant"),
        }
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    #[test]
    fn message_as_text_for_plain_content() {
        assert_eq!(Message::user("hi").as_text(), Some("hi"));
    }

    #[test]
    fn message_as_text_none_for_tool_blocks() {
        let m = Message::assistant_blocks(vec![ContentBlock::tool_use(
            "u",
            "t",
            json!({}),
        )]);
        assert!(m.as_text().is_none());
    }

    #[test]
    fn tool_uses_collects_in_order() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::text("thinking"),
            ContentBlock::tool_use("u1", "a", json!({})),
            ContentBlock::tool_use("u2", "b", json!({})),
        ]);
        let uses = m.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "u1");
        assert_eq!(uses[1].1, "b");
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(Message::user("").approx_tokens(), 1);
    }

    // ── Journal entries ───────────────────────────────────────────────────────

    #[test]
    fn journal_record_flattens_kind() {
        let rec = JournalRecord {
            ts: 42,
            entry: SessionEntry::Message {
                role: Role::User,
                content: MessageContent::Text("hi".into()),
            },
        };
        let text = serde_json::to_string(&rec).unwrap();
        assert!(text.contains("\"kind\":\"message\""));
        assert!(text.contains("\"ts\":42"));
        let back: JournalRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn usage_entry_flattens_counts() {
        let rec = JournalRecord {
            ts: 1,
            entry: SessionEntry::Usage {
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cache_tokens: 0,
                    total_tokens: 15,
                },
            },
        };
        let text = serde_json::to_string(&rec).unwrap();
        assert!(text.contains("\"input_tokens\":10"));
        let back: JournalRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn unknown_entry_kind_is_rejected() {
        let r: Result<JournalRecord, _> =
            serde_json::from_str(r#"{"ts":1,"kind":"checkpoint"}"#);
        assert!(r.is_err());
    }

    // ── Agent state ───────────────────────────────────────────────────────────

    #[test]
    fn agent_status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::ShuttingDown).unwrap(),
            "\"shutting-down\""
        );
    }

    #[test]
    fn agent_state_flattens_identity() {
        let st = AgentState::new(AgentIdentity {
            id: "dev-1".into(),
            role: AgentRole::Dev,
            host: "workstation".into(),
            machine_id: "m1".into(),
            address: None,
        });
        let text = serde_json::to_string(&st).unwrap();
        assert!(text.contains("\"id\":\"dev-1\""));
        assert!(text.contains("\"role\":\"dev\""));
    }

    // ── Task lifecycle ────────────────────────────────────────────────────────

    #[test]
    fn task_happy_path_transitions() {
        let mut t = Task::new("sum", "compute 2+2");
        assert_eq!(t.status, TaskStatus::Pending);
        t.transition(TaskStatus::Queued).unwrap();
        t.transition(TaskStatus::Assigned).unwrap();
        t.transition(TaskStatus::InProgress).unwrap();
        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.status.is_terminal());
    }

    #[test]
    fn completed_task_rejects_further_transitions() {
        let mut t = Task::new("t", "");
        t.status = TaskStatus::Completed;
        assert!(t.transition(TaskStatus::Queued).is_err());
        assert!(t.transition(TaskStatus::InProgress).is_err());
    }

    #[test]
    fn no_back_transition_to_pending() {
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn reclamation_edge_exists() {
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn task_status_kebab_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }
}
