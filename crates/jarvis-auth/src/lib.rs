// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Authentication and audit for the jarvis hub.
//!
//! Three pieces:
//! - [`token`] — random bearer tokens; dashboard tokens compared constant-time
//!   against the expected plaintext, machine tokens stored as SHA-256 digests.
//! - [`lockout`] — per-source failure counting with a capped, swept table.
//! - [`audit`] — non-blocking append-only JSONL security event log, with
//!   recursive secret redaction applied to every record.

pub mod audit;
pub mod lockout;
pub mod redact;
pub mod token;

pub use audit::{AuditKind, AuditLog, AuditRecord};
pub use lockout::LockoutTracker;
pub use redact::redact_value;
pub use token::{generate_token, DashboardToken, MachineToken};
