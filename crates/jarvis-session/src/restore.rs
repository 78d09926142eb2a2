// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Rebuild an LLM message list from a journal.

use std::collections::HashMap;

use jarvis_proto::{
    ContentBlock, JournalRecord, Message, MessageContent, SessionEntry, ToolResultContent,
};

const MISSING_RESULT: &str = "(result not found)";

/// Walk the journal in order and produce the message list the model should
/// see.
///
/// `message` entries map straight through.  When an assistant message carries
/// `tool_use` blocks, a synthetic user message follows it immediately,
/// containing the matching `tool_result` blocks in tool-use order — collected
/// from the `tool_result` entries anywhere later in the journal, keyed by
/// `tool_use_id`.  A missing result substitutes `"(result not found)"` with
/// `is_error = true`, so a journal cut off mid-task still restores into a
/// well-formed conversation.
pub fn restore_messages(records: &[JournalRecord]) -> Vec<Message> {
    // Results can land after the next assistant turn started streaming, so
    // index the whole journal first rather than scanning forward per use.
    let mut results: HashMap<&str, (&ToolResultContent, bool)> = HashMap::new();
    for record in records {
        if let SessionEntry::ToolResult {
            call_id,
            content,
            is_error,
        } = &record.entry
        {
            results.entry(call_id.as_str()).or_insert((content, *is_error));
        }
    }

    let mut out = Vec::new();
    for record in records {
        let SessionEntry::Message { role, content } = &record.entry else {
            continue;
        };
        let message = Message {
            role: *role,
            content: content.clone(),
        };
        let tool_uses: Vec<String> = message
            .tool_uses()
            .iter()
            .map(|(id, _, _)| id.to_string())
            .collect();
        out.push(message);

        if tool_uses.is_empty() {
            continue;
        }
        let blocks: Vec<ContentBlock> = tool_uses
            .iter()
            .map(|id| match results.get(id.as_str()) {
                Some((content, is_error)) => ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: (*content).clone(),
                    is_error: *is_error,
                },
                None => ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: ToolResultContent::Text(MISSING_RESULT.into()),
                    is_error: true,
                },
            })
            .collect();
        out.push(Message::user_blocks(blocks));
    }
    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────
