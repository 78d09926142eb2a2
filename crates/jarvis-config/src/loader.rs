// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::schema::{hostname, AgentConfig, HubConfig};

/// Config file locations searched lowest to highest priority.
fn search_paths(name: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from(format!("/etc/jarvis/{name}.yaml")));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(format!(".config/jarvis/{name}.yaml")));
    }
    paths.push(PathBuf::from(format!(".jarvis/{name}.yaml")));
    paths
}

fn read_layers(name: &str, extra: Option<&Path>) -> anyhow::Result<serde_yaml::Value> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    for path in search_paths(name) {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, parse_file(&path)?);
        }
    }
    if let Some(p) = extra {
        merge_yaml(&mut merged, parse_file(p)?);
    }
    Ok(merged)
}

fn parse_file(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(slot) => merge_yaml(slot, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}

/// Load hub config: files, then `PORT` / `HOST` / `AUTH_TOKEN` /
/// `JARVIS_BUS_URL` / `JARVIS_KV_PATH` / `JARVIS_STORAGE_ROOT` env overrides.
pub fn load_hub(extra: Option<&Path>) -> anyhow::Result<HubConfig> {
    let merged = read_layers("hub", extra)?;
    let mut config: HubConfig = if is_empty_mapping(&merged) {
        HubConfig::default()
    } else {
        serde_yaml::from_value(merged).context("hub config schema")?
    };

    if let Ok(host) = std::env::var("HOST") {
        config.host = host;
    }
    if let Ok(port) = std::env::var("PORT") {
        config.port = port.parse().context("PORT must be a number")?;
    }
    if let Ok(token) = std::env::var("AUTH_TOKEN") {
        if !token.is_empty() {
            config.auth_token = Some(token);
        }
    }
    if let Ok(bus) = std::env::var("JARVIS_BUS_URL") {
        config.bus_addr = bus;
    }
    if let Ok(kv) = std::env::var("JARVIS_KV_PATH") {
        config.kv_path = kv;
    }
    if let Ok(base) = std::env::var("JARVIS_STORAGE_ROOT") {
        config.storage.base = Some(base);
    }
    Ok(config)
}

/// Load agent config: files, then env overrides.  `JARVIS_AGENT_ID` and
/// `JARVIS_AGENT_ROLE` may supply the identity when no config file exists.
pub fn load_agent(extra: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let mut merged = read_layers("agent", extra)?;

    // Identity may come entirely from the environment (container deploys).
    if let serde_yaml::Value::Mapping(m) = &mut merged {
        if let Ok(id) = std::env::var("JARVIS_AGENT_ID") {
            m.insert("id".into(), id.into());
        }
        if let Ok(role) = std::env::var("JARVIS_AGENT_ROLE") {
            m.insert("role".into(), role.into());
        }
    }

    let mut config: AgentConfig =
        serde_yaml::from_value(merged).context("agent config schema (id and role required)")?;

    if let Ok(bus) = std::env::var("JARVIS_BUS_URL") {
        config.bus_addr = bus;
    }
    if let Ok(base) = std::env::var("JARVIS_STORAGE_ROOT") {
        config.storage.base = Some(base);
    }
    if let Ok(host) = std::env::var("JARVIS_REMOTE_EXEC_HOST") {
        if !host.is_empty() {
            config.remote_exec_host = Some(host);
        }
    }
    if config.machine_id.is_none() {
        config.machine_id = Some(hostname());
    }
    Ok(config)
}

fn is_empty_mapping(v: &serde_yaml::Value) -> bool {
    matches!(v, serde_yaml::Value::Mapping(m) if m.is_empty())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
