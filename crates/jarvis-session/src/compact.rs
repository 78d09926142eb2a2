// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Journal compaction.
//!
//! When a session accumulates at least [`COMPACT_THRESHOLD`] `message`
//! entries, everything before the last [`COMPACT_KEEP_RECENT`] messages is
//! replaced with one synthetic `meta` entry carrying a per-message summary.
//! The retained tail lines are copied byte-identically, and the rewrite goes
//! through a temp sibling + rename so a crash can never leave a truncated
//! journal.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde_json::json;
use tracing::debug;

use jarvis_proto::{ContentBlock, JournalRecord, MessageContent, Role, SessionEntry};

pub const COMPACT_THRESHOLD: usize = 20;
pub const COMPACT_KEEP_RECENT: usize = 15;
const SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactOutcome {
    /// Below the threshold; the file was not touched.
    Skipped,
    Compacted {
        messages_before: usize,
        messages_after: usize,
    },
}

/// Compact `path` in place when it holds at least `threshold` message
/// entries, keeping the newest `keep_recent` messages (and every entry
/// written after them) verbatim.
pub fn compact_file(
    path: &Path,
    threshold: usize,
    keep_recent: usize,
) -> anyhow::Result<CompactOutcome> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading journal {}", path.display()))?;
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut records = Vec::with_capacity(lines.len());
    for (n, line) in lines.iter().enumerate() {
        let record: JournalRecord = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: malformed journal line", path.display(), n + 1))?;
        records.push(record);
    }

    let message_lines: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r.entry, SessionEntry::Message { .. }))
        .map(|(i, _)| i)
        .collect();
    if message_lines.len() < threshold {
        return Ok(CompactOutcome::Skipped);
    }

    // Everything from the first retained message onward survives verbatim,
    // including interleaved tool_result and usage entries.
    let cut = message_lines[message_lines.len() - keep_recent];

    let mut summaries = Vec::new();
    let mut discarded = 0usize;
    for record in &records[..cut] {
        if let SessionEntry::Message { role, content } = &record.entry {
            summaries.push(format!(
                "[{}]: {}",
                role_name(*role),
                truncate_chars(&content_text(content), SUMMARY_CHARS)
            ));
            discarded += 1;
        }
    }

    let head_meta = match &records[0].entry {
        // The opening session meta survives compaction.
        SessionEntry::Meta { .. } => Some(lines[0]),
        _ => None,
    };

    let mut compaction_data = serde_json::Map::new();
    compaction_data.insert("compacted".into(), json!(true));
    compaction_data.insert("discarded_messages".into(), json!(discarded));
    compaction_data.insert("summary".into(), json!(summaries.join("\n")));
    let marker = JournalRecord::now(SessionEntry::Meta {
        data: compaction_data,
    });

    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut out = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        if let Some(head) = head_meta {
            writeln!(out, "{head}")?;
        }
        writeln!(out, "{}", serde_json::to_string(&marker)?)?;
        for line in &lines[cut..] {
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        out.sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} over {}", tmp.display(), path.display()))?;

    debug!(
        journal = %path.display(),
        discarded,
        kept = keep_recent,
        "journal compacted"
    );
    Ok(CompactOutcome::Compacted {
        messages_before: message_lines.len(),
        messages_after: keep_recent,
    })
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Flatten message content to summary text.  Tool blocks summarize to their
/// tool name rather than their full payload.
fn content_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.clone(),
                ContentBlock::Image { .. } => "<image>".into(),
                ContentBlock::ToolUse { name, .. } => format!("<tool_use {name}>"),
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    format!("<tool_result {tool_use_id}>")
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_records, restore_messages, Journal};
    use jarvis_proto::Message;

    fn filled_journal(dir: &Path, messages: usize) -> std::path::PathBuf {
        let mut journal = Journal::create(dir, "dev-1", None).unwrap();
        for i in 0..messages {
            let m = if i % 2 == 0 {
                Message::user(format!("question {i}"))
            } else {
                Message::assistant(format!("answer {i}"))
            };
            journal
                .append(SessionEntry::Message {
                    role: m.role,
                    content: m.content,
                })
                .unwrap();
        }
        journal.path().to_path_buf()
    }

    #[test]
    fn below_threshold_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = filled_journal(dir.path(), 10);
        let before = std::fs::read_to_string(&path).unwrap();
        let outcome = compact_file(&path, COMPACT_THRESHOLD, COMPACT_KEEP_RECENT).unwrap();
        assert_eq!(outcome, CompactOutcome::Skipped);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn over_threshold_keeps_last_fifteen_byte_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = filled_journal(dir.path(), 30);
        let before = std::fs::read_to_string(&path).unwrap();
        let tail_before: Vec<&str> = before.lines().rev().take(COMPACT_KEEP_RECENT).collect();

        let outcome = compact_file(&path, COMPACT_THRESHOLD, COMPACT_KEEP_RECENT).unwrap();
        assert_eq!(
            outcome,
            CompactOutcome::Compacted {
                messages_before: 30,
                messages_after: 15
            }
        );

        let after = std::fs::read_to_string(&path).unwrap();
        let tail_after: Vec<&str> = after.lines().rev().take(COMPACT_KEEP_RECENT).collect();
        assert_eq!(tail_before, tail_after, "retained tail must be byte-identical");

        let records = read_records(&path).unwrap();
        let message_count = records
            .iter()
            .filter(|r| matches!(r.entry, SessionEntry::Message { .. }))
            .count();
        assert_eq!(message_count, COMPACT_KEEP_RECENT);
    }

    #[test]
    fn summary_lists_discarded_messages_with_roles() {
        let dir = tempfile::tempdir().unwrap();
        let path = filled_journal(dir.path(), 20);
        compact_file(&path, COMPACT_THRESHOLD, COMPACT_KEEP_RECENT).unwrap();

        let records = read_records(&path).unwrap();
        // Line 0: session meta, line 1: compaction marker.
        match &records[1].entry {
            SessionEntry::Meta { data } => {
                assert_eq!(data["compacted"], true);
                assert_eq!(data["discarded_messages"], 5);
                let summary = data["summary"].as_str().unwrap();
                assert!(summary.contains("[user]: question 0"));
                assert!(summary.contains("[assistant]: answer 3"));
                assert!(!summary.contains("question 10"), "retained not summarized");
            }
            other => panic!("expected compaction meta, got {other:?}"),
        }
    }

    #[test]
    fn long_messages_truncate_at_200_chars() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path(), "dev-1", None).unwrap();
        let long = "x".repeat(500);
        for _ in 0..COMPACT_THRESHOLD {
            journal
                .append(SessionEntry::Message {
                    role: jarvis_proto::Role::User,
                    content: MessageContent::Text(long.clone()),
                })
                .unwrap();
        }
        let path = journal.path().to_path_buf();
        compact_file(&path, COMPACT_THRESHOLD, COMPACT_KEEP_RECENT).unwrap();
        let records = read_records(&path).unwrap();
        match &records[1].entry {
            SessionEntry::Meta { data } => {
                let summary = data["summary"].as_str().unwrap();
                let first_line = summary.lines().next().unwrap();
                // "[user]: " prefix plus 200 chars.
                assert_eq!(first_line.len(), "[user]: ".len() + 200);
            }
            other => panic!("expected compaction meta, got {other:?}"),
        }
    }

    #[test]
    fn compacted_journal_still_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = filled_journal(dir.path(), 25);
        compact_file(&path, COMPACT_THRESHOLD, COMPACT_KEEP_RECENT).unwrap();
        let messages = restore_messages(&read_records(&path).unwrap());
        assert_eq!(messages.len(), COMPACT_KEEP_RECENT);
        assert_eq!(messages.last().unwrap().as_text(), Some("question 24")); // 25th message
    }

    #[test]
    fn journal_handle_compact_reopens_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path(), "dev-1", None).unwrap();
        for i in 0..COMPACT_THRESHOLD {
            journal
                .append(SessionEntry::Message {
                    role: jarvis_proto::Role::User,
                    content: MessageContent::Text(format!("m{i}")),
                })
                .unwrap();
        }
        let outcome = journal.compact().unwrap();
        assert!(matches!(outcome, CompactOutcome::Compacted { .. }));
        assert_eq!(journal.message_count(), COMPACT_KEEP_RECENT);
        // Appends keep working on the rewritten file.
        journal
            .append(SessionEntry::Message {
                role: jarvis_proto::Role::Assistant,
                content: MessageContent::Text("after compact".into()),
            })
            .unwrap();
        assert_eq!(journal.message_count(), COMPACT_KEEP_RECENT + 1);
    }
}
