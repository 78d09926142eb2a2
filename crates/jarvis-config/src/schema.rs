// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use jarvis_proto::AgentRole;

/// Hub process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Listen address for the WebSocket surface.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Dashboard bearer token.  When unset a token is generated at startup
    /// and printed once.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Listen address for the bus broker, `host:port`.
    #[serde(default = "default_bus_addr")]
    pub bus_addr: String,
    /// Path of the KV database file.
    #[serde(default = "default_kv_path")]
    pub kv_path: String,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Seconds between heartbeat sweeps; also the expected agent heartbeat
    /// interval.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds of heartbeat silence after which an agent is marked offline
    /// and its in-progress task is reclaimed.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Path of the audit log file.  `None` puts it under the storage base.
    #[serde(default)]
    pub audit_log: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        // serde_json round-trip through an empty map would work too; spelling
        // the defaults out keeps them greppable.
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
            bus_addr: default_bus_addr(),
            kv_path: default_kv_path(),
            storage: StorageConfig::default(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            audit_log: None,
        }
    }
}

/// Agent process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub role: AgentRole,
    /// Human-readable host label shown in the peer table.
    #[serde(default = "default_host_label")]
    pub host_label: String,
    /// Stable machine identifier; defaults to the hostname.
    #[serde(default)]
    pub machine_id: Option<String>,
    /// Capability tags advertised at discovery (e.g. `["code", "deploy"]`).
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Bus broker address, `host:port`.
    #[serde(default = "default_bus_addr")]
    pub bus_addr: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Optional remote host for route-overridden tools (e.g. shell execution
    /// bridged to another machine).
    #[serde(default)]
    pub remote_exec_host: Option<String>,
}

/// Shared-storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Preferred base path (the shared mount).  When unreachable the layout
    /// falls back to `./jarvis-data` and flags itself degraded.
    #[serde(default)]
    pub base: Option<String>,
}

/// Model routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Primary model id, resolved through the provider registry.
    #[serde(default = "default_model")]
    pub primary: String,
    /// Tried in order when the primary (or an earlier fallback) fails.
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            primary: default_model(),
            fallbacks: Vec::new(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Per-task loop budgets.  Exceeding either fails the task with
/// `budget_exceeded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_wall_clock")]
    pub wall_clock_secs: u64,
    #[serde(default = "default_token_budget")]
    pub total_tokens: u64,
    #[serde(default = "default_max_rounds")]
    pub max_tool_rounds: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            wall_clock_secs: default_wall_clock(),
            total_tokens: default_token_budget(),
            max_tool_rounds: default_max_rounds(),
        }
    }
}

/// Tool-safety configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Extra sandbox roots beyond workspace/storage/temp/home.
    #[serde(default)]
    pub extra_roots: Vec<String>,
    /// Tool calls allowed per key per minute.
    #[serde(default = "default_rate_capacity")]
    pub rate_per_minute: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            extra_roots: Vec::new(),
            rate_per_minute: default_rate_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    7600
}
fn default_bus_addr() -> String {
    "127.0.0.1:7601".into()
}
fn default_kv_path() -> String {
    "jarvis-kv.db".into()
}
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_host_label() -> String {
    hostname()
}
fn default_model() -> String {
    "claude-sonnet-4-5".into()
}
fn default_max_output_tokens() -> u32 {
    8192
}
fn default_temperature() -> f32 {
    0.2
}
fn default_wall_clock() -> u64 {
    600
}
fn default_token_budget() -> u64 {
    200_000
}
fn default_max_rounds() -> u32 {
    24
}
fn default_rate_capacity() -> u32 {
    60
}

pub(crate) fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown-host".into())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
