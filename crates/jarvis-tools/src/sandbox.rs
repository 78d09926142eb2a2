// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Filesystem sandbox for tool path arguments.
//!
//! Relative paths resolve against the agent workspace.  The post-symlink
//! real path must land inside one of the allow-listed roots, must not contain
//! any deny-listed segment (credential material), and — for writes — must not
//! touch package manifests, version-control internals, or vendor trees.

use std::path::{Component, Path, PathBuf};

use crate::error::SafetyError;

/// Path segments that are never readable or writable.
const DENY_SEGMENTS: &[&str] = &[
    ".ssh",
    ".aws",
    ".gnupg",
    ".kube",
    ".docker",
    "id_rsa",
    "id_ed25519",
    "id_ecdsa",
    "credentials",
    "shadow",
    "sudoers",
];

/// Segments additionally denied for write operations.
const WRITE_DENY_SEGMENTS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "vendor",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
];

#[derive(Debug, Clone)]
pub struct PathSandbox {
    workspace: PathBuf,
    roots: Vec<PathBuf>,
}

impl PathSandbox {
    /// Allow-list: the workspace itself, the shared-storage base, the system
    /// temp dir, the home dir, plus any configured extras.
    pub fn new(workspace: &Path, extra_roots: &[PathBuf]) -> Self {
        let mut roots = vec![workspace.to_path_buf()];
        roots.push(std::env::temp_dir());
        if let Some(home) = std::env::var_os("HOME") {
            roots.push(PathBuf::from(home));
        }
        roots.extend(extra_roots.iter().cloned());
        let roots = roots
            .into_iter()
            .filter_map(|r| r.canonicalize().ok())
            .collect();
        Self {
            workspace: workspace.to_path_buf(),
            roots,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve a path argument for reading.
    pub fn resolve_read(&self, raw: &str) -> Result<PathBuf, SafetyError> {
        let resolved = self.resolve(raw)?;
        check_segments(&resolved, DENY_SEGMENTS, raw)?;
        Ok(resolved)
    }

    /// Resolve a path argument for writing (stricter deny list).
    pub fn resolve_write(&self, raw: &str) -> Result<PathBuf, SafetyError> {
        let resolved = self.resolve(raw)?;
        check_segments(&resolved, DENY_SEGMENTS, raw)?;
        for component in resolved.components() {
            if let Component::Normal(seg) = component {
                let seg = seg.to_string_lossy();
                if WRITE_DENY_SEGMENTS.iter().any(|d| seg.eq_ignore_ascii_case(d)) {
                    return Err(SafetyError::WriteDenied(raw.to_string()));
                }
            }
        }
        Ok(resolved)
    }

    fn resolve(&self, raw: &str) -> Result<PathBuf, SafetyError> {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace.join(candidate)
        };
        let resolved = canonicalize_allow_missing(&joined)
            .map_err(|_| SafetyError::PathOutsideSandbox(raw.to_string()))?;
        if !self.roots.iter().any(|root| resolved.starts_with(root)) {
            return Err(SafetyError::PathOutsideSandbox(raw.to_string()));
        }
        Ok(resolved)
    }
}

fn check_segments(path: &Path, deny: &[&str], raw: &str) -> Result<(), SafetyError> {
    for component in path.components() {
        if let Component::Normal(seg) = component {
            let seg = seg.to_string_lossy();
            // `.env`, `.env.local`, `.env.production` are all env files.
            if seg == ".env" || seg.starts_with(".env.") {
                return Err(SafetyError::PathDenied(raw.to_string()));
            }
            if deny.iter().any(|d| seg.eq_ignore_ascii_case(d)) {
                return Err(SafetyError::PathDenied(raw.to_string()));
            }
        }
    }
    Ok(())
}

/// Canonicalize following symlinks on every existing prefix; the missing
/// tail is appended after rejecting traversal components.
fn canonicalize_allow_missing(path: &Path) -> std::io::Result<PathBuf> {
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
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?
                    .to_os_string();
                if matches!(
                    Path::new(&name).components().next(),
                    Some(Component::ParentDir)
                ) {
                    return Err(std::io::ErrorKind::PermissionDenied.into());
                }
                tail.push(name);
                existing = existing
                    .parent()
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?
                    .to_path_buf();
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
