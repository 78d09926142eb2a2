// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "jarvis",
    about = "Distributed multi-agent orchestration fabric",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log to stderr at debug level (RUST_LOG still wins when set).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the hub: bus broker, KV store, scheduler, WebSocket surface.
    ///
    /// Reads `PORT`, `HOST`, `AUTH_TOKEN`, `JARVIS_BUS_URL`, `JARVIS_KV_PATH`,
    /// and `JARVIS_STORAGE_ROOT` from the environment on top of the config
    /// file.  When no token is configured one is generated and printed once.
    Hub {
        /// Path to the hub config file.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Start one agent runtime.
    ///
    /// The agent identity comes from the config file or from
    /// `JARVIS_AGENT_ID` / `JARVIS_AGENT_ROLE`.
    Agent {
        /// Path to the agent config file.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Generate a fresh dashboard token and print it once.
    Token,

    /// Print the effective hub configuration and exit.
    ShowConfig {
        /// Path to the hub config file.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}
