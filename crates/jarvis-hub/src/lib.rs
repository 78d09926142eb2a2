// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The hub: the single authoritative node of the fabric.
//!
//! It hosts the bus broker, owns agent and task state in the KV, terminates
//! dashboard WebSockets, schedules tasks onto agents, and sweeps heartbeats.

mod consumers;
mod methods;
mod scheduler;
mod server;
mod state;

pub use methods::{MethodError, MethodRegistry};
pub use scheduler::{admit_task, reclaim_task, schedule_queued};
pub use state::{AgentEntry, ClientHandle, HubState};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use jarvis_auth::{generate_token, AuditLog, DashboardToken};
use jarvis_bus::Broker;
use jarvis_config::HubConfig;
use jarvis_kv::Kv;
use jarvis_store::StorageLayout;

/// A running hub and its background tasks.
pub struct Hub {
    state: Arc<HubState>,
    broker: Broker,
    ws_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    lockout_sweeper: tokio::task::JoinHandle<()>,
    kv_sweeper: tokio::task::JoinHandle<()>,
    audit_writer: tokio::task::JoinHandle<()>,
}

impl Hub {
    /// Bring the whole control plane up: storage tree, KV, broker, bus
    /// consumers, sweepers, and the WebSocket listener.
    ///
    /// When no `auth_token` is configured a fresh one is generated and
    /// printed once — the only time it ever appears anywhere.
    pub async fn start(config: HubConfig) -> anyhow::Result<Self> {
        let storage = StorageLayout::open(config.storage.base.as_deref().map(std::path::Path::new))?;
        storage.ensure_tree()?;
        if storage.is_degraded() {
            tracing::warn!(
                base = %storage.base().display(),
                "shared storage unreachable; running on local fallback"
            );
        }

        let audit_path = match &config.audit_log {
            Some(p) => std::path::PathBuf::from(p),
            None => storage.logs_dir()?.join("audit.jsonl"),
        };
        let (audit, audit_writer) = AuditLog::open(audit_path);

        let kv_path = storage.base().join(&config.kv_path);
        let kv = Kv::open(&kv_path).context("opening kv store")?;
        let kv_sweeper = kv.spawn_sweeper();

        let broker = Broker::bind(&config.bus_addr).await?;
        let bus = broker.local_client();

        let token = match &config.auth_token {
            Some(t) => DashboardToken::new(t.clone()),
            None => {
                let raw = generate_token();
                println!("dashboard token (save it, shown once): {raw}");
                DashboardToken::new(raw)
            }
        };

        let state = Arc::new(HubState::new(config, kv, bus, token, audit));
        let lockout_sweeper = state.lockout.spawn_sweeper();
        let tasks = consumers::spawn_all(&state).await?;

        let server_state = server::ServerState {
            hub: Arc::clone(&state),
            methods: Arc::new(MethodRegistry::standard()),
        };
        let listener = tokio::net::TcpListener::bind((
            state.config.host.as_str(),
            state.config.port,
        ))
        .await
        .with_context(|| format!("binding {}:{}", state.config.host, state.config.port))?;
        let ws_addr = listener.local_addr()?;
        info!(addr = %ws_addr, "hub websocket listening");

        let app = server::router(server_state)
            .into_make_service_with_connect_info::<SocketAddr>();
        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("websocket server stopped: {e}");
            }
        });

        let mut all_tasks = tasks;
        all_tasks.push(server_task);

        Ok(Self {
            state,
            broker,
            ws_addr,
            tasks: all_tasks,
            lockout_sweeper,
            kv_sweeper,
            audit_writer,
        })
    }

    pub fn state(&self) -> Arc<HubState> {
        Arc::clone(&self.state)
    }

    /// Address of the WebSocket listener (useful when bound to port 0).
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    pub fn bus_addr(&self) -> Option<SocketAddr> {
        self.broker.local_addr()
    }

    /// Announce shutdown, stop the listener and every background task, and
    /// flush the audit log.
    pub async fn shutdown(mut self) {
        self.state.broadcast(
            "infrastructure.status",
            serde_json::json!({ "state": "stopping" }),
        );
        for task in &self.tasks {
            task.abort();
        }
        self.lockout_sweeper.abort();
        self.kv_sweeper.abort();
        self.broker.shutdown();
        // Dropping the state releases the audit sender; the writer drains.
        // External holders of `state()` clones would keep it alive, so bound
        // the wait.
        drop(self.state);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), self.audit_writer).await;
    }
}
