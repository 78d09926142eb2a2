// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Canonical bus subjects.
//!
//! Every subject that carries an interpolated token goes through
//! [`sanitize`] so that a hostile agent id can never widen a subscription
//! (`*`, `>`) or splice extra subject levels (`.`).

/// Strip characters that have meaning in subject routing.
///
/// Removed: `.` (level separator), `*` and `>` (wildcards), whitespace, and
/// ASCII control characters.
pub fn sanitize(token: &str) -> String {
    token
        .chars()
        .filter(|c| !matches!(c, '.' | '*' | '>') && !c.is_whitespace() && !c.is_control())
        .collect()
}

pub fn agent_status(id: &str) -> String {
    format!("jarvis.agent.{}.status", sanitize(id))
}

pub fn agent_task(id: &str) -> String {
    format!("jarvis.agent.{}.task", sanitize(id))
}

pub fn agent_result(id: &str) -> String {
    format!("jarvis.agent.{}.result", sanitize(id))
}

pub fn agent_heartbeat(id: &str) -> String {
    format!("jarvis.agent.{}.heartbeat", sanitize(id))
}

pub fn agent_dm(id: &str) -> String {
    format!("jarvis.agent.{}.dm", sanitize(id))
}

pub fn task_progress(task_id: &str) -> String {
    format!("jarvis.task.{}.progress", sanitize(task_id))
}

pub const AGENTS_BROADCAST: &str = "jarvis.agents.broadcast";
pub const AGENTS_DISCOVERY: &str = "jarvis.agents.discovery";
pub const COORDINATION_REQUEST: &str = "jarvis.coordination.request";
pub const COORDINATION_RESPONSE: &str = "jarvis.coordination.response";
pub const CHAT_BROADCAST: &str = "jarvis.chat.broadcast";
pub const CHAT_STREAM: &str = "jarvis.chat.stream";
pub const BROADCAST_DASHBOARD: &str = "jarvis.broadcast.dashboard";

pub fn chat(id: &str) -> String {
    format!("jarvis.chat.{}", sanitize(id))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
