// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Task admission, agent selection, and reclamation.
//!
//! Selection rule: an agent is eligible when it is idle and its capability
//! set covers the task's requirements.  Among eligible agents the one with
//! the fewest active tasks wins (always zero for idle agents, so this is a
//! forward-compatible guard), tie-broken by the earliest last assignment.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use jarvis_proto::{keys, subjects, AgentStatus, Task, TaskPriority, TaskStatus};

use crate::state::HubState;

const PRIORITIES: [TaskPriority; 4] = [
    TaskPriority::Critical,
    TaskPriority::High,
    TaskPriority::Normal,
    TaskPriority::Low,
];

/// Persist a new task as `queued` and try to place it immediately.
pub async fn admit_task(state: &Arc<HubState>, mut task: Task) -> anyhow::Result<Task> {
    if task.status == TaskStatus::Pending {
        task.transition(TaskStatus::Queued)?;
    }
    state.kv.set_json(&keys::task(&task.id), &task, None)?;
    state.kv.zadd(
        &keys::task_queue(task.priority),
        &task.id,
        chrono::Utc::now().timestamp_millis() as f64,
    )?;
    state.broadcast("task.updated", serde_json::to_value(&task)?);
    debug!(task = %task.id, "task queued");

    schedule_queued(state).await;
    // Return the current stored form (it may already be assigned).
    Ok(state
        .kv
        .get_json(&keys::task(&task.id))?
        .unwrap_or(task))
}

/// Walk the queues highest priority first and place everything that fits.
pub async fn schedule_queued(state: &Arc<HubState>) {
    for priority in PRIORITIES {
        let queue_key = keys::task_queue(priority);
        let waiting = match state.kv.zrange(&queue_key, 0, -1) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("queue read failed: {e}");
                return;
            }
        };
        for task_id in waiting {
            if !try_assign(state, &task_id).await {
                // No agent for this one; later entries may still fit (they
                // can require different capabilities).
                continue;
            }
        }
    }
}

/// Attempt to place one queued task.  Returns `true` when it was assigned.
async fn try_assign(state: &Arc<HubState>, task_id: &str) -> bool {
    let mut task: Task = match state.kv.get_json(&keys::task(task_id)) {
        Ok(Some(t)) => t,
        Ok(None) => {
            // Stale queue entry; drop it from every priority queue.
            for priority in PRIORITIES {
                let _ = state.kv.zrem(&keys::task_queue(priority), task_id);
            }
            return false;
        }
        Err(e) => {
            warn!("task read failed: {e}");
            return false;
        }
    };
    if task.status != TaskStatus::Queued {
        let _ = state.kv.zrem(&keys::task_queue(task.priority), task_id);
        return false;
    }

    let chosen = {
        let agents = state.agents.read().expect("agent lock");
        agents
            .values()
            .filter(|entry| entry.state.status == AgentStatus::Idle)
            .filter(|entry| {
                task.required_capabilities
                    .iter()
                    .all(|cap| entry.capabilities.contains(cap))
            })
            .min_by_key(|entry| {
                let load = u64::from(entry.state.current_task_id.is_some());
                (load, entry.last_assignment_ms)
            })
            .map(|entry| entry.state.identity.id.clone())
    };
    let Some(agent_id) = chosen else {
        debug!(task = %task.id, "no eligible idle agent");
        return false;
    };

    if task.transition(TaskStatus::Assigned).is_err() {
        return false;
    }
    task.assigned_agent = Some(agent_id.clone());
    if let Err(e) = state.kv.set_json(&keys::task(&task.id), &task, None) {
        warn!("task persist failed: {e}");
        return false;
    }
    let _ = state.kv.zrem(&keys::task_queue(task.priority), task_id);

    {
        let mut agents = state.agents.write().expect("agent lock");
        if let Some(entry) = agents.get_mut(&agent_id) {
            entry.last_assignment_ms = chrono::Utc::now().timestamp_millis();
            // Optimistically busy so the next scheduling pass skips it; the
            // agent's own heartbeat confirms.
            entry.state.status = AgentStatus::Busy;
            entry.state.current_task_id = Some(task.id.clone());
        }
    }

    if let Err(e) = state
        .bus
        .publish_json(&subjects::agent_task(&agent_id), &task)
        .await
    {
        warn!("task publish failed: {e}");
    }
    state.broadcast(
        "task.updated",
        serde_json::to_value(&task).unwrap_or(json!({})),
    );
    info!(task = %task.id, agent = %agent_id, "task assigned");
    true
}

/// Return an offline agent's in-flight task to the queue and try to place it
/// elsewhere.
pub async fn reclaim_task(state: &Arc<HubState>, task_id: &str) {
    let mut task: Task = match state.kv.get_json(&keys::task(task_id)) {
        Ok(Some(t)) => t,
        _ => return,
    };
    if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
        return;
    }
    if task.transition(TaskStatus::Queued).is_err() {
        return;
    }
    task.assigned_agent = None;
    if let Err(e) = state.kv.set_json(&keys::task(&task.id), &task, None) {
        warn!("task persist failed: {e}");
        return;
    }
    let _ = state.kv.zadd(
        &keys::task_queue(task.priority),
        &task.id,
        chrono::Utc::now().timestamp_millis() as f64,
    );
    state.broadcast(
        "task.updated",
        serde_json::to_value(&task).unwrap_or(json!({})),
    );
    info!(task = %task.id, "task reclaimed to queue");
    schedule_queued(state).await;
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentEntry;
    use jarvis_auth::{AuditLog, DashboardToken};
    use jarvis_bus::Broker;
    use jarvis_config::HubConfig;
    use jarvis_kv::Kv;
    use jarvis_proto::{AgentIdentity, AgentRole, AgentState};

    fn agent_entry(id: &str, caps: &[&str], last_assignment_ms: i64) -> AgentEntry {
        let mut state = AgentState::new(AgentIdentity {
            id: id.into(),
            role: AgentRole::Dev,
            host: "host".into(),
            machine_id: "m".into(),
            address: None,
        });
        state.status = AgentStatus::Idle;
        AgentEntry {
            state,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            last_assignment_ms,
        }
    }

    async fn hub() -> (Broker, Arc<HubState>) {
        let broker = Broker::in_process();
        let state = Arc::new(HubState::new(
            HubConfig::default(),
            Kv::open_memory().unwrap(),
            broker.local_client(),
            DashboardToken::new("t"),
            AuditLog::disabled(),
        ));
        (broker, state)
    }

    fn insert_agent(state: &Arc<HubState>, entry: AgentEntry) {
        state
            .agents
            .write()
            .unwrap()
            .insert(entry.state.identity.id.clone(), entry);
    }

    #[tokio::test]
    async fn task_without_agents_stays_queued() {
        let (_broker, state) = hub().await;
        let task = admit_task(&state, Task::new("t", "d")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn idle_capable_agent_gets_the_task() {
        let (broker, state) = hub().await;
        let observer = broker.local_client();
        let mut sub = observer
            .subscribe(&subjects::agent_task("dev-1"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        insert_agent(&state, agent_entry("dev-1", &["code"], 0));
        let mut t = Task::new("sum 2+2", "");
        t.required_capabilities = vec!["code".into()];
        let task = admit_task(&state, t).await.unwrap();

        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent.as_deref(), Some("dev-1"));

        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let wire_task: Task = msg.json().unwrap();
        assert_eq!(wire_task.id, task.id);
    }

    #[tokio::test]
    async fn capability_mismatch_leaves_task_queued() {
        let (_broker, state) = hub().await;
        insert_agent(&state, agent_entry("marketing-1", &["copywriting"], 0));
        let mut t = Task::new("build", "");
        t.required_capabilities = vec!["code".into()];
        let task = admit_task(&state, t).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn busy_agents_are_not_selected() {
        let (_broker, state) = hub().await;
        let mut busy = agent_entry("dev-1", &["code"], 0);
        busy.state.status = AgentStatus::Busy;
        insert_agent(&state, busy);
        let mut t = Task::new("t", "");
        t.required_capabilities = vec!["code".into()];
        let task = admit_task(&state, t).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn tie_breaks_by_earliest_last_assignment() {
        let (_broker, state) = hub().await;
        insert_agent(&state, agent_entry("dev-recent", &[], 1000));
        insert_agent(&state, agent_entry("dev-idle-longest", &[], 10));
        let task = admit_task(&state, Task::new("t", "")).await.unwrap();
        assert_eq!(task.assigned_agent.as_deref(), Some("dev-idle-longest"));
    }

    #[tokio::test]
    async fn second_task_waits_when_only_agent_is_taken() {
        let (_broker, state) = hub().await;
        insert_agent(&state, agent_entry("dev-1", &[], 0));
        let first = admit_task(&state, Task::new("first", "")).await.unwrap();
        let second = admit_task(&state, Task::new("second", "")).await.unwrap();
        assert_eq!(first.status, TaskStatus::Assigned);
        assert_eq!(second.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn reclaim_returns_task_to_queue_and_reassigns() {
        let (_broker, state) = hub().await;
        insert_agent(&state, agent_entry("dev-1", &[], 0));
        let task = admit_task(&state, Task::new("t", "")).await.unwrap();
        assert_eq!(task.assigned_agent.as_deref(), Some("dev-1"));

        // dev-1 dies; dev-2 appears idle.
        {
            let mut agents = state.agents.write().unwrap();
            agents.get_mut("dev-1").unwrap().state.status = AgentStatus::Offline;
        }
        insert_agent(&state, agent_entry("dev-2", &[], 0));

        reclaim_task(&state, &task.id).await;
        let after: Task = state.kv.get_json(&keys::task(&task.id)).unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Assigned);
        assert_eq!(after.assigned_agent.as_deref(), Some("dev-2"));
    }

    #[tokio::test]
    async fn critical_tasks_schedule_before_low() {
        let (_broker, state) = hub().await;
        // Queue two tasks with no agents, then add an agent and run the
        // scheduler: the critical one must win the single slot.
        let mut low = Task::new("low", "");
        low.priority = TaskPriority::Low;
        let mut critical = Task::new("critical", "");
        critical.priority = TaskPriority::Critical;
        let low = admit_task(&state, low).await.unwrap();
        let critical = admit_task(&state, critical).await.unwrap();
        assert_eq!(low.status, TaskStatus::Queued);
        assert_eq!(critical.status, TaskStatus::Queued);

        insert_agent(&state, agent_entry("dev-1", &[], 0));
        schedule_queued(&state).await;

        let low: Task = state.kv.get_json(&keys::task(&low.id)).unwrap().unwrap();
        let critical: Task = state
            .kv
            .get_json(&keys::task(&critical.id))
            .unwrap()
            .unwrap();
        assert_eq!(critical.status, TaskStatus::Assigned);
        assert_eq!(low.status, TaskStatus::Queued);
    }
}
