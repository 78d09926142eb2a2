// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration for hub and agent processes.
//!
//! Precedence, lowest to highest: built-in defaults → YAML config file →
//! process environment.  CLI flags are applied by the binary on top of the
//! loaded config.

mod loader;
mod schema;

pub use loader::{load_agent, load_hub};
pub use schema::{
    AgentConfig, BudgetConfig, HubConfig, ModelConfig, SafetyConfig, StorageConfig,
};
