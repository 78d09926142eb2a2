// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bearer tokens.
//!
//! # Security model
//!
//! Dashboard tokens are process-lifetime secrets held in memory and compared
//! constant-time against the presented value.  Machine tokens are long-lived:
//! only their SHA-256 digest is kept, so a leaked state file yields a hash,
//! not a credential.  All comparisons use [`subtle::ConstantTimeEq`] to
//! prevent timing oracles.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generate a cryptographically random token: 32 bytes from the OS CSPRNG,
/// hex-encoded (64 characters).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The dashboard bearer token, held in memory for the process lifetime.
#[derive(Clone)]
pub struct DashboardToken(String);

impl DashboardToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Constant-time comparison against the presented token.
    pub fn verify(&self, provided: &str) -> bool {
        // ct_eq on unequal lengths short-circuits inside subtle without
        // leaking content; pad to equal length so only the length leaks.
        let expected = self.0.as_bytes();
        let provided = provided.as_bytes();
        if expected.len() != provided.len() {
            return false;
        }
        bool::from(expected.ct_eq(provided))
    }

    /// The raw token, for the loopback `/auth/token` endpoint only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for DashboardToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token value.
        write!(f, "DashboardToken(***)")
    }
}

/// A machine token digest.  The raw token is shown once at issuance; only
/// `SHA-256(token)` is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineToken(#[serde(with = "hex_bytes")] [u8; 32]);

impl MachineToken {
    /// Digest a freshly issued raw token.
    pub fn from_raw(raw: &str) -> Self {
        Self(sha256(raw.as_bytes()))
    }

    /// Constant-time verification: `SHA-256(provided) == digest`.
    pub fn verify(&self, provided: &str) -> bool {
        bool::from(sha256(provided.as_bytes()).ct_eq(&self.0))
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Serde helper: `[u8; 32]` as a lowercase hex string.
mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("expected 32-byte hex"))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
