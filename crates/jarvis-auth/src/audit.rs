// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Append-only security event log.
//!
//! One JSON object per line.  Records are handed to a dedicated writer task
//! through a bounded channel so the hot path never blocks on disk; when the
//! channel is full the record is dropped with a warning rather than stalling
//! an auth decision.  Every record passes through [`crate::redact_value`]
//! before it is serialized.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::redact::redact_value;

/// Audited event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    #[serde(rename = "auth.success")]
    AuthSuccess,
    #[serde(rename = "auth.failure")]
    AuthFailure,
    #[serde(rename = "auth.blocked")]
    AuthBlocked,
    #[serde(rename = "security.blocked_path")]
    BlockedPath,
    #[serde(rename = "security.blocked_command")]
    BlockedCommand,
    #[serde(rename = "security.blocked_url")]
    BlockedUrl,
    #[serde(rename = "security.rate_limited")]
    RateLimited,
    #[serde(rename = "privileged")]
    Privileged,
}

/// One audit log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub source: String,
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "agentId", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, source: impl Into<String>, details: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            source: source.into(),
            details,
            ip: None,
            agent_id: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// Handle to the audit log.  Cheap to clone.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditRecord>,
}

const QUEUE_DEPTH: usize = 1024;

impl AuditLog {
    /// Open (creating if needed) the log at `path` and spawn the writer task.
    /// The returned handle stops the writer when aborted; records sent before
    /// the abort are flushed line-by-line.
    pub fn open(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let path = path.into();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = tokio::spawn(writer_task(path, rx));
        (Self { tx }, handle)
    }

    /// A log that discards everything.  For tests and tools that must run
    /// without a storage mount.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// Append a record.  Never blocks: a full queue drops the record with a
    /// warning.  Sensitive fields in `details` are redacted here, before the
    /// record leaves the caller's context.
    pub fn record(&self, mut record: AuditRecord) {
        redact_value(&mut record.details);
        if let Err(e) = self.tx.try_send(record) {
            warn!("audit queue full, dropping record: {e}");
        }
    }
}

async fn writer_task(path: PathBuf, mut rx: mpsc::Receiver<AuditRecord>) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
    }
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), "cannot open audit log: {e}");
            // Drain so senders never see a closed channel error spike.
            while rx.recv().await.is_some() {}
            return;
        }
    };

    while let Some(record) = rx.recv().await {
        match serde_json::to_string(&record) {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("audit write failed: {e}");
                }
                let _ = file.flush().await;
            }
            Err(e) => warn!("audit record serialization failed: {e}"),
        }
    }
    let _ = file.flush().await;
}

/// Read an audit log back as records (diagnostics and tests).
pub fn read_log(path: &Path) -> anyhow::Result<Vec<AuditRecord>> {
    let text = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(line)?);
    }
    Ok(out)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
