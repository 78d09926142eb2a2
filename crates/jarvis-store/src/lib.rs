// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared-storage layout.
//!
//! Everything the fabric persists lives in one named tree under a single base
//! path — typically a shared mount visible to the hub and every agent host.
//! When the preferred base is unreachable the layout falls back to a local
//! directory under the process working directory and flags itself degraded so
//! operators can see that agents are not sharing state.
//!
//! Path resolution is strict: any resolved path that escapes the base after
//! symlink resolution is rejected.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("path escapes storage base: {0}")]
    Escape(String),
    #[error("invalid path segment: {0}")]
    BadSegment(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The named directories of the tree.
const DIRS: &[&str] = &[
    "sessions",
    "workspace/projects",
    "workspace/artifacts",
    "knowledge",
    "logs",
    "media",
    "config",
    "channels",
    "chat",
    "cron-jobs",
    "workflows",
    "workflow-runs",
    "timelines",
    "plugins",
    "skills",
    "metrics",
    "plans",
];

const LOCAL_FALLBACK: &str = "jarvis-data";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    base: PathBuf,
    degraded: bool,
}

impl StorageLayout {
    /// Open the layout under `preferred`, or fall back to
    /// `<cwd>/jarvis-data` when the preferred base cannot be written.
    pub fn open(preferred: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(base) = preferred {
            match probe_writable(base) {
                Ok(canonical) => {
                    return Ok(Self {
                        base: canonical,
                        degraded: false,
                    })
                }
                Err(e) => {
                    warn!(
                        base = %base.display(),
                        "preferred storage base unreachable, using local fallback: {e}"
                    );
                }
            }
        }
        let local = std::env::current_dir()?.join(LOCAL_FALLBACK);
        let canonical = probe_writable(&local)?;
        Ok(Self {
            base: canonical,
            degraded: preferred.is_some(),
        })
    }

    /// Open directly at `base` with no fallback (tests).
    pub fn at(base: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            base: probe_writable(base)?,
            degraded: false,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `true` when the preferred shared mount was unreachable and the layout
    /// is running on process-local storage.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    // ── Named directories ─────────────────────────────────────────────────────

    pub fn sessions_dir(&self, agent_id: &str) -> Result<PathBuf, StoreError> {
        let seg = safe_segment(agent_id)?;
        self.ensure(Path::new("sessions").join(seg))
    }

    pub fn channel_dir(&self, channel: &str) -> Result<PathBuf, StoreError> {
        let seg = safe_segment(channel)?;
        self.ensure(Path::new("channels").join(seg))
    }

    pub fn projects_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("workspace/projects")
    }

    pub fn artifacts_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("workspace/artifacts")
    }

    pub fn knowledge_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("knowledge")
    }

    pub fn logs_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("logs")
    }

    pub fn media_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("media")
    }

    pub fn config_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("config")
    }

    pub fn chat_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("chat")
    }

    pub fn cron_jobs_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("cron-jobs")
    }

    pub fn workflows_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("workflows")
    }

    pub fn workflow_runs_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("workflow-runs")
    }

    pub fn timelines_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("timelines")
    }

    pub fn plugins_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("plugins")
    }

    pub fn skills_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("skills")
    }

    pub fn metrics_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("metrics")
    }

    pub fn plans_dir(&self) -> Result<PathBuf, StoreError> {
        self.ensure("plans")
    }

    /// Create the whole named tree up front (hub startup).
    pub fn ensure_tree(&self) -> Result<(), StoreError> {
        for d in DIRS {
            self.ensure(d)?;
        }
        Ok(())
    }

    // ── Resolution ────────────────────────────────────────────────────────────

    /// Resolve `relative` against the base.  The result is canonicalized
    /// (following symlinks on every existing prefix) and rejected if it lands
    /// outside the base.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf, StoreError> {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            return Err(StoreError::Escape(relative.display().to_string()));
        }
        let joined = self.base.join(relative);
        let resolved = canonicalize_allow_missing(&joined)?;
        if !resolved.starts_with(&self.base) {
            return Err(StoreError::Escape(relative.display().to_string()));
        }
        Ok(resolved)
    }

    fn ensure(&self, relative: impl AsRef<Path>) -> Result<PathBuf, StoreError> {
        let path = self.resolve(relative)?;
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

/// A single path segment: no separators, no traversal, non-empty.
fn safe_segment(s: &str) -> Result<&str, StoreError> {
    if s.is_empty()
        || s == "."
        || s == ".."
        || s.contains('/')
        || s.contains('\\')
        || s.contains('\0')
    {
        return Err(StoreError::BadSegment(s.to_string()));
    }
    Ok(s)
}

/// Canonicalize a path whose tail may not exist yet: the deepest existing
/// ancestor is canonicalized (resolving symlinks), the remainder is appended
/// after rejecting any `..` component.
fn canonicalize_allow_missing(path: &Path) -> Result<PathBuf, StoreError> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut out = canonical;
                for seg in tail.iter().rev() {
                    out.push(seg);
                }
                return Ok(out);
            }
            Err(_) => {
                let name = existing
                    .file_name()
                    .ok_or_else(|| StoreError::Escape(path.display().to_string()))?
                    .to_os_string();
                // Missing components must be plain names — a `..` in the
                // not-yet-existing tail would bypass the prefix check.
                if matches!(Path::new(&name).components().next(), Some(Component::ParentDir)) {
                    return Err(StoreError::Escape(path.display().to_string()));
                }
                tail.push(name);
                existing = existing
                    .parent()
                    .ok_or_else(|| StoreError::Escape(path.display().to_string()))?
                    .to_path_buf();
            }
        }
    }
}

fn probe_writable(base: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(base)?;
    let probe = base.join(".jarvis-write-probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    base.canonicalize()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
