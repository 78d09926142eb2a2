// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Validation for structured command inputs.
//!
//! Tools that splice model-supplied values into command lines (build
//! profiles, platform names, lane names) must pin enumerated values to an
//! explicit allow-list and reject anything carrying shell metacharacters.

use crate::error::SafetyError;

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '~', '!', '#',
    '\\', '"', '\'', '\n', '\r', '\0',
];

/// Check that `value` is one of the explicitly allowed values for `field`.
pub fn validate_enum_arg(field: &str, value: &str, allowed: &[&str]) -> Result<(), SafetyError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(SafetyError::CommandBlocked(format!(
            "{field}: {value:?} is not one of {allowed:?}"
        )))
    }
}

/// Reject values that could splice into a shell command.  Use for free-form
/// identifiers (branch names, target triples) that cannot be enumerated.
pub fn reject_shell_metacharacters(field: &str, value: &str) -> Result<(), SafetyError> {
    if value.is_empty() {
        return Err(SafetyError::CommandBlocked(format!("{field}: empty value")));
    }
    if value.chars().any(|c| SHELL_METACHARACTERS.contains(&c) || c.is_whitespace()) {
        return Err(SafetyError::CommandBlocked(format!(
            "{field}: {value:?} contains shell metacharacters"
        )));
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_arg_accepts_listed_values() {
        assert!(validate_enum_arg("profile", "release", &["debug", "release"]).is_ok());
    }

    #[test]
    fn enum_arg_rejects_unlisted_values() {
        assert!(validate_enum_arg("profile", "release; rm -rf /", &["debug", "release"]).is_err());
        assert!(validate_enum_arg("profile", "Release", &["debug", "release"]).is_err());
    }

    #[test]
    fn metacharacters_are_rejected() {
        for evil in [
            "x;reboot",
            "a|b",
            "a&&b",
            "$(whoami)",
            "`id`",
            "a b",
            "a\nb",
            "a>out",
            "weird*glob",
        ] {
            assert!(
                reject_shell_metacharacters("lane", evil).is_err(),
                "{evil:?} must be rejected"
            );
        }
    }

    #[test]
    fn plain_identifiers_pass() {
        for ok in ["release", "ios-simulator", "lane_42", "x86_64-unknown-linux-gnu"] {
            assert!(reject_shell_metacharacters("lane", ok).is_ok(), "{ok:?}");
        }
    }

    #[test]
    fn empty_value_is_rejected() {
        assert!(reject_shell_metacharacters("lane", "").is_err());
    }
}
