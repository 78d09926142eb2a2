// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Canonical KV key schema.  Keys are colon-delimited; interpolated tokens
//! reuse the subject sanitizer so a hostile id cannot splice key levels.

use crate::model::TaskPriority;
use crate::subjects::sanitize;

pub fn agent_status(id: &str) -> String {
    format!("jarvis:agent:{}:status", sanitize_key(id))
}

pub fn agent_capabilities(id: &str) -> String {
    format!("jarvis:agent:{}:capabilities", sanitize_key(id))
}

pub fn task(id: &str) -> String {
    format!("jarvis:task:{}", sanitize_key(id))
}

/// Per-priority queue of waiting task ids (sorted set scored by enqueue time).
pub fn task_queue(priority: TaskPriority) -> String {
    format!("jarvis:task:queue:{}", priority.as_str())
}

pub fn session(key: &str) -> String {
    format!("jarvis:session:{}", sanitize_key(key))
}

/// Maps a delegation id (issued by `message_agent`) to the admitted task.
pub fn delegation(id: &str) -> String {
    format!("jarvis:delegation:{}", sanitize_key(id))
}

pub const CONFIG: &str = "jarvis:config";

pub fn llm_cache(sha256_hex: &str) -> String {
    format!("jarvis:llm:cache:{}", sanitize_key(sha256_hex))
}

fn sanitize_key(token: &str) -> String {
    // Colons delimit key levels the way dots delimit subject levels.
    sanitize(token).replace(':', "")
}
