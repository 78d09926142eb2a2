// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent process: bus wiring, discovery, heartbeats, and the task loop.
//!
//! Logical threads, per the concurrency model: the main select loop consumes
//! task assignments and peer-roster broadcasts; a spawned DM consumer fills
//! the inbox (and answers directly while the agent is idle); a spawned
//! heartbeat task publishes status every interval regardless of what the
//! task loop is doing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use jarvis_bus::BusClient;
use jarvis_config::AgentConfig;
use jarvis_model::ProviderRegistry;
use jarvis_plugin::{HookContext, HookEvent, PluginHost};
use jarvis_proto::{
    coordination::{Discovery, Heartbeat},
    subjects, AgentMessage, AgentStatus, Task, TaskStatus,
};
use jarvis_store::StorageLayout;
use jarvis_tools::{builtin, PathSandbox, RateLimiter, ToolRegistry};

use crate::coordination_tools::{CheckDelegatedTaskTool, MessageAgentTool};
use crate::runner::{run_dm_turn, run_task, AgentContext};

/// Shared mutable status, read by the heartbeat task.
struct StatusCell {
    status: Mutex<AgentStatus>,
    current_task: Mutex<Option<String>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct AgentRuntime {
    ctx: Arc<AgentContext>,
    cell: Arc<StatusCell>,
}

impl AgentRuntime {
    /// Wire up an agent: storage, sandbox, tool registry (built-ins,
    /// coordination tools, plugin tools, route overrides), and the shared
    /// context.  `plugins` should already have `start_services` called.
    pub fn new(
        config: AgentConfig,
        providers: Arc<ProviderRegistry>,
        mut plugins: PluginHost,
        bus: BusClient,
        storage: &StorageLayout,
        audit: jarvis_auth::AuditLog,
    ) -> anyhow::Result<Self> {
        let sessions_dir = storage.sessions_dir(&config.id)?;
        let workspace = storage.projects_dir()?;
        let extra_roots: Vec<std::path::PathBuf> = std::iter::once(storage.base().to_path_buf())
            .chain(config.safety.extra_roots.iter().map(Into::into))
            .collect();
        let sandbox = Arc::new(PathSandbox::new(&workspace, &extra_roots));

        let limiter = RateLimiter::new(config.safety.rate_per_minute);
        limiter.start_sweeper();
        let mut tools = ToolRegistry::new().with_limiter(limiter);
        builtin::register_builtins(
            &mut tools,
            &builtin::ToolContext {
                agent_id: config.id.clone(),
                sandbox,
                audit,
            },
        );
        tools.register(MessageAgentTool::new(&config.id, bus.clone()));
        tools.register(CheckDelegatedTaskTool::new(bus.clone()));
        plugins.install_tools(&mut tools);

        // Remote execution host: shell calls ride the bridging tool (which a
        // plugin provides) with the same contract.  The host name ends up in
        // transport command lines, so it gets the metacharacter gate.
        if let Some(host) = &config.remote_exec_host {
            jarvis_tools::exec_guard::reject_shell_metacharacters("remote_exec_host", host)?;
            tools.set_route_override("shell", "remote_exec", host);
        }

        let ctx = Arc::new(AgentContext {
            config: Arc::new(config),
            bus,
            providers,
            tools: Arc::new(tools),
            plugins: Arc::new(plugins),
            sessions_dir,
            peers: Arc::new(RwLock::new(Vec::new())),
            inbox: Arc::new(Mutex::new(Vec::new())),
        });
        Ok(Self {
            ctx,
            cell: Arc::new(StatusCell {
                status: Mutex::new(AgentStatus::Starting),
                current_task: Mutex::new(None),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        })
    }

    pub fn context(&self) -> Arc<AgentContext> {
        Arc::clone(&self.ctx)
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let config = &ctx.config;
        let hook_ctx = HookContext {
            agent_id: config.id.clone(),
            session_id: None,
            config: json!({ "role": config.role }),
        };

        let mut task_sub = ctx.bus.subscribe(&subjects::agent_task(&config.id)).await?;
        let mut roster_sub = ctx.bus.subscribe(subjects::AGENTS_BROADCAST).await?;

        self.publish_discovery("online").await;
        ctx.plugins.emit(&HookEvent::AgentStart, &hook_ctx).await;
        *self.cell.status.lock().expect("status lock") = AgentStatus::Idle;

        let heartbeat = self.spawn_heartbeat();
        let dm_pump = self.spawn_dm_pump().await?;

        info!(agent = %config.id, role = ?config.role, "agent online");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means nobody can ask us to stop any
                    // more; treat it as a stop to avoid spinning.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                msg = task_sub.recv() => {
                    let Some(msg) = msg else { break };
                    match msg.json::<Task>() {
                        Ok(task) => self.execute_task(task).await,
                        Err(e) => warn!("malformed task assignment: {e}"),
                    }
                }
                msg = roster_sub.recv() => {
                    let Some(msg) = msg else { break };
                    if let Ok(roster) = msg.json::<Vec<Discovery>>() {
                        let mut peers = ctx.peers.write().expect("peer lock");
                        *peers = roster
                            .into_iter()
                            .filter(|p| p.agent_id != config.id)
                            .collect();
                    }
                }
            }
        }

        *self.cell.status.lock().expect("status lock") = AgentStatus::ShuttingDown;
        self.publish_discovery("offline").await;
        ctx.plugins.emit(&HookEvent::AgentEnd, &hook_ctx).await;
        ctx.plugins.shutdown().await;
        heartbeat.abort();
        dm_pump.abort();
        info!(agent = %config.id, "agent offline");
        Ok(())
    }

    async fn execute_task(&self, task: Task) {
        let ctx = &self.ctx;
        {
            *self.cell.status.lock().expect("status lock") = AgentStatus::Busy;
            *self.cell.current_task.lock().expect("task lock") = Some(task.id.clone());
        }
        // Heartbeat immediately so the hub sees busy before the first sweep.
        self.publish_heartbeat().await;

        let outcome = run_task(ctx, &task).await;
        match outcome.status {
            TaskStatus::Completed => {
                self.cell.completed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.cell.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            *self.cell.status.lock().expect("status lock") = AgentStatus::Idle;
            *self.cell.current_task.lock().expect("task lock") = None;
        }
        self.publish_heartbeat().await;
    }

    /// DM consumer: while idle, answer inline; while busy, queue for
    /// injection into the running task's next turn.
    async fn spawn_dm_pump(&self) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let ctx = Arc::clone(&self.ctx);
        let cell = Arc::clone(&self.cell);
        let mut dm_sub = ctx.bus.subscribe(&subjects::agent_dm(&ctx.config.id)).await?;
        Ok(tokio::spawn(async move {
            while let Some(msg) = dm_sub.recv().await {
                let dm = match msg.json::<AgentMessage>() {
                    Ok(dm) => dm,
                    Err(e) => {
                        warn!("malformed dm: {e}");
                        continue;
                    }
                };
                let busy = *cell.status.lock().expect("status lock") == AgentStatus::Busy;
                if busy {
                    debug!(from = %dm.from, "queueing dm for the running task");
                    ctx.inbox.lock().expect("inbox lock").push(dm);
                    continue;
                }
                if let Some(reply) = run_dm_turn(&ctx, &dm).await {
                    let subject = subjects::agent_dm(&reply.to);
                    if let Err(e) = ctx.bus.publish_json(&subject, &reply).await {
                        warn!("dm reply failed: {e}");
                    }
                }
            }
        }))
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let cell = Arc::clone(&self.cell);
        let interval = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                publish_heartbeat_inner(&ctx, &cell).await;
            }
        })
    }

    async fn publish_heartbeat(&self) {
        publish_heartbeat_inner(&self.ctx, &self.cell).await;
    }

    async fn publish_discovery(&self, status: &str) {
        let config = &self.ctx.config;
        let discovery = Discovery {
            agent_id: config.id.clone(),
            role: config.role,
            host: config.host_label.clone(),
            ip: None,
            status: status.to_string(),
            capabilities: config.capabilities.clone(),
        };
        if let Err(e) = self
            .ctx
            .bus
            .publish_json(subjects::AGENTS_DISCOVERY, &discovery)
            .await
        {
            warn!("discovery publish failed: {e}");
        }
    }
}

async fn publish_heartbeat_inner(ctx: &AgentContext, cell: &StatusCell) {
    let heartbeat = Heartbeat {
        agent_id: ctx.config.id.clone(),
        status: *cell.status.lock().expect("status lock"),
        current_task_id: cell.current_task.lock().expect("task lock").clone(),
        completed: cell.completed.load(Ordering::Relaxed),
        failed: cell.failed.load(Ordering::Relaxed),
        sent_at_ms: chrono::Utc::now().timestamp_millis(),
    };
    let subject = subjects::agent_heartbeat(&ctx.config.id);
    if let Err(e) = ctx.bus.publish_json(&subject, &heartbeat).await {
        warn!("heartbeat publish failed: {e}");
    }
}
