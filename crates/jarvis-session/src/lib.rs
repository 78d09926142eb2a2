// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session journals.
//!
//! One file per session, one JSON-encoded [`JournalRecord`] per line, LF
//! terminated.  The first line is always a `meta` entry recording the session
//! id, the owning agent, the originating task, and the start time.
//!
//! The journal is append-only with a single writer (the owning agent loop);
//! readers may open it read-only at any time.  The only rewrite ever
//! performed is [`Journal::compact`], which is atomic (temp sibling +
//! rename).

mod compact;
mod restore;

pub use compact::{compact_file, CompactOutcome, COMPACT_KEEP_RECENT, COMPACT_THRESHOLD};
pub use restore::restore_messages;

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::Rng;
use serde_json::json;

use jarvis_proto::{JournalRecord, SessionEntry};

/// Build a session id: `<agent-id>-<epoch-millis>-<6 hex>`.
///
/// The epoch component keeps ids monotonic per agent; the random suffix
/// guards against two sessions starting in the same millisecond.
pub fn new_session_id(agent_id: &str) -> String {
    let epoch = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..0x1000000);
    format!("{agent_id}-{epoch}-{suffix:06x}")
}

/// An open session journal.
pub struct Journal {
    session_id: String,
    path: PathBuf,
    file: File,
    message_count: usize,
}

impl Journal {
    /// Create a fresh journal under `dir` and write the opening `meta` line.
    pub fn create(dir: &Path, agent_id: &str, task_id: Option<&str>) -> anyhow::Result<Self> {
        let session_id = new_session_id(agent_id);
        let path = dir.join(format!("{session_id}.jsonl"));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("creating journal {}", path.display()))?;

        let mut journal = Self {
            session_id: session_id.clone(),
            path,
            file,
            message_count: 0,
        };
        let mut data = serde_json::Map::new();
        data.insert("id".into(), json!(session_id));
        data.insert("agent".into(), json!(agent_id));
        if let Some(task) = task_id {
            data.insert("task_id".into(), json!(task));
        }
        data.insert("started_at".into(), json!(chrono::Utc::now().to_rfc3339()));
        journal.append(SessionEntry::Meta { data })?;
        Ok(journal)
    }

    /// Reopen an existing journal for appending (crash recovery).
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let records = read_records(path)?;
        let session_id = records
            .first()
            .and_then(|r| match &r.entry {
                SessionEntry::Meta { data } => {
                    data.get("id").and_then(|v| v.as_str()).map(str::to_string)
                }
                _ => None,
            })
            .with_context(|| format!("{}: first line is not a session meta", path.display()))?;
        let message_count = records
            .iter()
            .filter(|r| matches!(r.entry, SessionEntry::Message { .. }))
            .count();
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("opening journal {}", path.display()))?;
        Ok(Self {
            session_id,
            path: path.to_path_buf(),
            file,
            message_count,
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of `message` entries written so far.
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Append one entry and flush.  Appends are serialized by construction:
    /// the journal has a single owner.
    pub fn append(&mut self, entry: SessionEntry) -> anyhow::Result<()> {
        if matches!(entry, SessionEntry::Message { .. }) {
            self.message_count += 1;
        }
        let record = JournalRecord::now(entry);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        self.file.flush()?;
        Ok(())
    }

    /// Read the full journal back (including entries appended by this handle).
    pub fn records(&self) -> anyhow::Result<Vec<JournalRecord>> {
        read_records(&self.path)
    }

    /// Compact when over the message threshold; see [`compact_file`].  The
    /// append handle is re-opened onto the rewritten file.
    pub fn compact(&mut self) -> anyhow::Result<CompactOutcome> {
        let outcome = compact_file(&self.path, COMPACT_THRESHOLD, COMPACT_KEEP_RECENT)?;
        if let CompactOutcome::Compacted { .. } = outcome {
            self.file = OpenOptions::new().append(true).open(&self.path)?;
            self.message_count = self
                .records()?
                .iter()
                .filter(|r| matches!(r.entry, SessionEntry::Message { .. }))
                .count();
        }
        Ok(outcome)
    }
}

/// Parse a journal file into records.  Blank lines are skipped; a malformed
/// line is an error (journals are machine-written).
pub fn read_records(path: &Path) -> anyhow::Result<Vec<JournalRecord>> {
    let file =
        File::open(path).with_context(|| format!("reading journal {}", path.display()))?;
    let mut out = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed journal line", path.display(), n + 1))?;
        out.push(record);
    }
    Ok(out)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
