// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Hub { config } => run_hub(config.as_deref()).await,
        Commands::Agent { config } => run_agent(config.as_deref()).await,
        Commands::Token => {
            println!("{}", jarvis_auth::generate_token());
            Ok(())
        }
        Commands::ShowConfig { config } => {
            let config = jarvis_config::load_hub(config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_hub(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = jarvis_config::load_hub(config_path)?;
    let hub = jarvis_hub::Hub::start(config).await?;
    tracing::info!(ws = %hub.ws_addr(), "hub running, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    hub.shutdown().await;
    Ok(())
}

async fn run_agent(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = jarvis_config::load_agent(config_path)?;
    let storage = jarvis_store::StorageLayout::open(
        config.storage.base.as_deref().map(std::path::Path::new),
    )?;
    if storage.is_degraded() {
        tracing::warn!(
            base = %storage.base().display(),
            "shared storage unreachable; running on local fallback"
        );
    }

    let audit_path = storage
        .logs_dir()?
        .join(format!("agent-{}-audit.jsonl", config.id));
    let (audit, audit_writer) = jarvis_auth::AuditLog::open(audit_path);

    let providers = Arc::new(jarvis_model::registry_from_env().await);
    let mut plugins = jarvis_plugin::PluginHost::load(&[]);
    plugins.start_services();

    let bus = jarvis_bus::BusClient::connect(config.bus_addr.clone());
    let runtime = jarvis_agent::AgentRuntime::new(config, providers, plugins, bus, &storage, audit)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(true);
    });

    runtime.run(shutdown_rx).await?;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), audit_writer).await;
    Ok(())
}
