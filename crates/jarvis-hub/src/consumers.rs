// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bus consumers: the hub-side halves of discovery, heartbeating, task
//! results, delegation, and progress streaming.
//!
//! All of these handlers are idempotent — the bus is at-least-once, so a
//! replayed discovery, heartbeat, or result must land on the same state.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use jarvis_proto::{
    coordination::{DelegationRequest, Discovery, FollowUpQuery, FollowUpReply, Heartbeat, TaskResult},
    keys, subjects, AgentIdentity, AgentState, AgentStatus, Task, TaskStatus,
};

use crate::scheduler;
use crate::state::{AgentEntry, HubState};

const RESULTS_HASH: &str = "jarvis:task:results";

/// Spawn every consumer plus the heartbeat sweeper.  Handles abort on drop
/// of the hub.
pub async fn spawn_all(state: &Arc<HubState>) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    Ok(vec![
        spawn_discovery(state).await?,
        spawn_heartbeats(state).await?,
        spawn_results(state).await?,
        spawn_coordination_requests(state).await?,
        spawn_coordination_responses(state).await?,
        spawn_progress(state).await?,
        spawn_sweeper(state),
    ])
}

async fn spawn_discovery(state: &Arc<HubState>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut sub = state.bus.subscribe(subjects::AGENTS_DISCOVERY).await?;
    let state = Arc::clone(state);
    Ok(tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            let discovery: Discovery = match msg.json() {
                Ok(d) => d,
                Err(e) => {
                    warn!("malformed discovery: {e}");
                    continue;
                }
            };
            handle_discovery(&state, discovery).await;
        }
    }))
}

async fn handle_discovery(state: &Arc<HubState>, discovery: Discovery) {
    let online = discovery.status == "online";
    info!(agent = %discovery.agent_id, online, "agent discovery");

    let mut reclaim: Option<String> = None;
    {
        let mut agents = state.agents.write().expect("agent lock");
        let entry = agents
            .entry(discovery.agent_id.clone())
            .or_insert_with(|| AgentEntry {
                state: AgentState::new(AgentIdentity {
                    id: discovery.agent_id.clone(),
                    role: discovery.role,
                    host: discovery.host.clone(),
                    machine_id: discovery.host.clone(),
                    address: discovery.ip.clone(),
                }),
                capabilities: discovery.capabilities.clone(),
                last_assignment_ms: 0,
            });
        entry.capabilities = discovery.capabilities.clone();
        entry.state.last_heartbeat_ms = chrono::Utc::now().timestamp_millis();
        if online {
            entry.state.status = AgentStatus::Idle;
        } else {
            entry.state.status = AgentStatus::Offline;
            reclaim = entry.state.current_task_id.take();
        }
        persist_agent(state, entry);
    }

    if let Some(task_id) = reclaim {
        scheduler::reclaim_task(state, &task_id).await;
    }

    broadcast_roster(state).await;
    state.broadcast(
        "agent.updated",
        json!({ "agentId": discovery.agent_id, "status": discovery.status }),
    );
    if online {
        scheduler::schedule_queued(state).await;
    }
}

/// Push the current online roster to every agent (peer tables) and to
/// dashboard clients.
async fn broadcast_roster(state: &Arc<HubState>) {
    let roster: Vec<Discovery> = {
        let agents = state.agents.read().expect("agent lock");
        agents
            .values()
            .filter(|e| e.state.status != AgentStatus::Offline)
            .map(|e| Discovery {
                agent_id: e.state.identity.id.clone(),
                role: e.state.identity.role,
                host: e.state.identity.host.clone(),
                ip: e.state.identity.address.clone(),
                status: "online".into(),
                capabilities: e.capabilities.clone(),
            })
            .collect()
    };
    if let Err(e) = state
        .bus
        .publish_json(subjects::AGENTS_BROADCAST, &roster)
        .await
    {
        warn!("roster broadcast failed: {e}");
    }
}

async fn spawn_heartbeats(state: &Arc<HubState>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut sub = state.bus.subscribe("jarvis.agent.*.heartbeat").await?;
    let state = Arc::clone(state);
    Ok(tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            let heartbeat: Heartbeat = match msg.json() {
                Ok(h) => h,
                Err(e) => {
                    warn!("malformed heartbeat: {e}");
                    continue;
                }
            };
            handle_heartbeat(&state, heartbeat).await;
        }
    }))
}

async fn handle_heartbeat(state: &Arc<HubState>, heartbeat: Heartbeat) {
    let mut promote: Option<String> = None;
    {
        let mut agents = state.agents.write().expect("agent lock");
        let Some(entry) = agents.get_mut(&heartbeat.agent_id) else {
            debug!(agent = %heartbeat.agent_id, "heartbeat from undiscovered agent");
            return;
        };
        // The hub's clock is authoritative for timeout sweeps; the sender's
        // timestamp is informational only.
        entry.state.last_heartbeat_ms = chrono::Utc::now().timestamp_millis();
        entry.state.status = heartbeat.status;
        entry.state.current_task_id = heartbeat.current_task_id.clone();
        entry.state.completed = heartbeat.completed;
        entry.state.failed = heartbeat.failed;
        persist_agent(state, entry);
        if heartbeat.status == AgentStatus::Busy {
            promote = heartbeat.current_task_id.clone();
        }
    }

    // A busy heartbeat naming an assigned task confirms pickup.
    if let Some(task_id) = promote {
        if let Ok(Some(mut task)) = state.kv.get_json::<Task>(&keys::task(&task_id)) {
            if task.status == TaskStatus::Assigned && task.transition(TaskStatus::InProgress).is_ok()
            {
                let _ = state.kv.set_json(&keys::task(&task_id), &task, None);
                state.broadcast(
                    "task.updated",
                    serde_json::to_value(&task).unwrap_or(json!({})),
                );
            }
        }
    }

    // Idle heartbeats free capacity.
    if heartbeat.status == AgentStatus::Idle {
        scheduler::schedule_queued(state).await;
    }
}

async fn spawn_results(state: &Arc<HubState>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut sub = state.bus.subscribe("jarvis.agent.*.result").await?;
    let state = Arc::clone(state);
    Ok(tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            let result: TaskResult = match msg.json() {
                Ok(r) => r,
                Err(e) => {
                    warn!("malformed task result: {e}");
                    continue;
                }
            };
            handle_result(&state, result).await;
        }
    }))
}

async fn handle_result(state: &Arc<HubState>, result: TaskResult) {
    info!(task = %result.task_id, status = ?result.status, "task result");
    let Ok(Some(mut task)) = state.kv.get_json::<Task>(&keys::task(&result.task_id)) else {
        warn!(task = %result.task_id, "result for unknown task");
        return;
    };
    // An agent can finish before the pickup heartbeat promoted the task.
    if task.status == TaskStatus::Assigned {
        let _ = task.transition(TaskStatus::InProgress);
    }
    if task.status != result.status && task.transition(result.status).is_err() {
        // Replayed delivery: the task is already terminal.  Idempotent no-op.
        return;
    }
    let _ = state.kv.set_json(&keys::task(&task.id), &task, None);
    if let Some(summary) = &result.summary {
        let _ = state
            .kv
            .hset(RESULTS_HASH, &task.id, summary.as_bytes());
    }
    {
        let mut agents = state.agents.write().expect("agent lock");
        if let Some(entry) = agents.get_mut(&result.agent_id) {
            if entry.state.current_task_id.as_deref() == Some(task.id.as_str()) {
                entry.state.current_task_id = None;
                entry.state.status = AgentStatus::Idle;
            }
            persist_agent(state, entry);
        }
    }
    state.broadcast(
        "task.updated",
        serde_json::to_value(&task).unwrap_or(json!({})),
    );
    scheduler::schedule_queued(state).await;
}

/// Delegations from agents: admit as tasks, remember the mapping for
/// follow-up queries.  Dedup on the delegation id (at-least-once bus).
async fn spawn_coordination_requests(
    state: &Arc<HubState>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut sub = state.bus.subscribe(subjects::COORDINATION_REQUEST).await?;
    let state = Arc::clone(state);
    Ok(tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            let request: DelegationRequest = match msg.json() {
                Ok(r) => r,
                Err(e) => {
                    warn!("malformed delegation: {e}");
                    continue;
                }
            };
            let mapping_key = keys::delegation(&request.id);
            match state.kv.get(&mapping_key) {
                Ok(Some(_)) => {
                    debug!(delegation = %request.id, "duplicate delegation ignored");
                    continue;
                }
                Err(e) => {
                    warn!("kv error: {e}");
                    continue;
                }
                Ok(None) => {}
            }
            let mut task = Task::new(&request.title, &request.description);
            task.priority = request.priority;
            task.required_capabilities = request.required_capabilities.clone();
            let task_id = task.id.clone();
            if let Err(e) = state
                .kv
                .set_json(&mapping_key, &json!({ "task_id": task_id }), None)
            {
                warn!("delegation mapping persist failed: {e}");
            }
            info!(delegation = %request.id, task = %task_id, from = %request.from,
                  "delegation admitted");
            if let Err(e) = scheduler::admit_task(&state, task).await {
                warn!("delegation admit failed: {e}");
            }
        }
    }))
}

/// Follow-up service: answers `check_delegated_task` requests from task
/// state.
async fn spawn_coordination_responses(
    state: &Arc<HubState>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut sub = state.bus.subscribe(subjects::COORDINATION_RESPONSE).await?;
    let state = Arc::clone(state);
    Ok(tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            let Ok(query) = msg.json::<FollowUpQuery>() else {
                continue;
            };
            let reply = follow_up_reply(&state, &query);
            match serde_json::to_vec(&reply) {
                Ok(bytes) => {
                    if let Err(e) = state.bus.respond(&msg, bytes).await {
                        warn!("follow-up reply failed: {e}");
                    }
                }
                Err(e) => warn!("follow-up encode failed: {e}"),
            }
        }
    }))
}

fn follow_up_reply(state: &Arc<HubState>, query: &FollowUpQuery) -> FollowUpReply {
    let mut reply = FollowUpReply {
        delegation_id: query.delegation_id.clone(),
        task_id: None,
        status: None,
        assigned_agent: None,
        result_summary: None,
    };
    let mapping: Option<serde_json::Value> = state
        .kv
        .get_json(&keys::delegation(&query.delegation_id))
        .ok()
        .flatten();
    let Some(task_id) = mapping
        .as_ref()
        .and_then(|m| m["task_id"].as_str())
        .map(str::to_string)
    else {
        return reply;
    };
    let Ok(Some(task)) = state.kv.get_json::<Task>(&keys::task(&task_id)) else {
        return reply;
    };
    reply.task_id = Some(task_id.clone());
    reply.status = Some(task.status);
    reply.assigned_agent = task.assigned_agent;
    reply.result_summary = state
        .kv
        .hget(RESULTS_HASH, &task_id)
        .ok()
        .flatten()
        .map(|b| String::from_utf8_lossy(&b).into_owned());
    reply
}

/// Task progress → dashboard `chat.stream` events.
async fn spawn_progress(state: &Arc<HubState>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut sub = state.bus.subscribe("jarvis.task.*.progress").await?;
    let state = Arc::clone(state);
    Ok(tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            if let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&msg.payload) {
                state.broadcast("chat.stream", payload);
            }
        }
    }))
}

/// Heartbeat timeout sweep: agents silent past the timeout go offline and
/// their in-flight work is reclaimed.
fn spawn_sweeper(state: &Arc<HubState>) -> tokio::task::JoinHandle<()> {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(state.config.heartbeat_interval_secs.max(1));
        let timeout_ms = (state.config.heartbeat_timeout_secs * 1000) as i64;
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;
        loop {
            tick.tick().await;
            sweep_once(&state, timeout_ms).await;
        }
    })
}

pub(crate) async fn sweep_once(state: &Arc<HubState>, timeout_ms: i64) {
    let now = chrono::Utc::now().timestamp_millis();
    let mut reclaim = Vec::new();
    {
        let mut agents = state.agents.write().expect("agent lock");
        for entry in agents.values_mut() {
            if entry.state.status == AgentStatus::Offline {
                continue;
            }
            if now - entry.state.last_heartbeat_ms > timeout_ms {
                warn!(agent = %entry.state.identity.id, "heartbeat timeout, marking offline");
                entry.state.status = AgentStatus::Offline;
                if let Some(task_id) = entry.state.current_task_id.take() {
                    reclaim.push(task_id);
                }
                persist_agent(state, entry);
                state.broadcast(
                    "agent.updated",
                    json!({ "agentId": entry.state.identity.id, "status": "offline" }),
                );
            }
        }
    }
    for task_id in reclaim {
        scheduler::reclaim_task(state, &task_id).await;
    }
}

fn persist_agent(state: &HubState, entry: &AgentEntry) {
    let id = &entry.state.identity.id;
    if let Err(e) = state.kv.set_json(&keys::agent_status(id), &entry.state, None) {
        warn!("agent state persist failed: {e}");
    }
    if let Err(e) = state
        .kv
        .set_json(&keys::agent_capabilities(id), &entry.capabilities, None)
    {
        warn!("agent capabilities persist failed: {e}");
    }
}
