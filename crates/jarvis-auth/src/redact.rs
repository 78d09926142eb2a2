// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Recursive secret redaction for anything that reaches a log.

use serde_json::Value;

const REDACTED: &str = "***REDACTED***";
const MAX_DEPTH: usize = 10;

/// Field-name fragments that mark a value as sensitive (case-insensitive).
const SENSITIVE: &[&str] = &["key", "token", "password", "secret", "credential"];

/// Replace every sensitive field in `value` with `***REDACTED***`, recursing
/// into objects and arrays at most 10 levels deep.  Anything deeper is
/// replaced wholesale — an attacker must not be able to smuggle a secret past
/// the redactor by nesting it.
pub fn redact_value(value: &mut Value) {
    redact_at(value, 0);
}

fn redact_at(value: &mut Value, depth: usize) {
    if depth >= MAX_DEPTH {
        *value = Value::String(REDACTED.into());
        return;
    }
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                if is_sensitive(k) {
                    *v = Value::String(REDACTED.into());
                } else {
                    redact_at(v, depth + 1);
                }
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                redact_at(v, depth + 1);
            }
        }
        _ => {}
    }
}

fn is_sensitive(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    SENSITIVE.iter().any(|s| lower.contains(s))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
