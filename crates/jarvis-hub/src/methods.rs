// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Named-method dispatch for the WebSocket surface.
//!
//! Handlers take `(state, params, client_id)` and return a result value or a
//! coded error.  Method names are hierarchical; unknown names yield
//! `METHOD_NOT_FOUND`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use jarvis_proto::{frames::code, keys, subjects, AgentMessage, AgentMessageKind, Task, TaskPriority, TaskStatus};

use crate::scheduler;
use crate::state::HubState;

#[derive(Debug)]
pub struct MethodError {
    pub code: u32,
    pub message: String,
}

impl MethodError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: code::INVALID_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: code::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: code::INTERNAL,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for MethodError {
    fn from(e: anyhow::Error) -> Self {
        Self::internal(format!("{e:#}"))
    }
}

type MethodResult = Result<Value, MethodError>;
type Handler =
    fn(Arc<HubState>, Value, u64) -> BoxFuture<'static, MethodResult>;

/// Maps method names to handlers.
pub struct MethodRegistry {
    methods: HashMap<&'static str, Handler>,
}

macro_rules! handler {
    ($f:path) => {{
        fn shim(state: Arc<HubState>, params: Value, client: u64) -> BoxFuture<'static, MethodResult> {
            Box::pin($f(state, params, client))
        }
        shim as Handler
    }};
}

impl MethodRegistry {
    /// The full built-in method table.
    pub fn standard() -> Self {
        let mut methods: HashMap<&'static str, Handler> = HashMap::new();
        methods.insert("tasks.create", handler!(tasks_create));
        methods.insert("tasks.cancel", handler!(tasks_cancel));
        methods.insert("tasks.list", handler!(tasks_list));
        methods.insert("agents.list", handler!(agents_list));
        methods.insert("agents.message", handler!(agents_message));
        methods.insert("channels.list", handler!(channels_list));
        methods.insert("channels.send", handler!(channels_send));
        methods.insert("channels.status", handler!(channels_status));
        methods.insert("channels.messages", handler!(channels_messages));
        methods.insert("channels.config", handler!(channels_config));
        methods.insert("system.metrics", handler!(system_metrics));
        methods.insert("imessage.status", handler!(imessage_status));
        methods.insert("imessage.send", handler!(imessage_send));
        methods.insert("imessage.messages", handler!(imessage_messages));
        Self { methods }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(
        &self,
        state: Arc<HubState>,
        method: &str,
        params: Value,
        client_id: u64,
    ) -> MethodResult {
        match self.methods.get(method) {
            Some(handler) => handler(state, params, client_id).await,
            None => Err(MethodError {
                code: code::METHOD_NOT_FOUND,
                message: format!("unknown method: {method}"),
            }),
        }
    }
}

// ── tasks.* ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateTaskParams {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<TaskPriority>,
    #[serde(default, alias = "requiredCapabilities")]
    required_capabilities: Vec<String>,
}

async fn tasks_create(state: Arc<HubState>, params: Value, _client: u64) -> MethodResult {
    let params: CreateTaskParams =
        serde_json::from_value(params).map_err(|e| MethodError::invalid(e.to_string()))?;
    if params.title.trim().is_empty() {
        return Err(MethodError::invalid("title must not be empty"));
    }
    let mut task = Task::new(params.title, params.description);
    if let Some(priority) = params.priority {
        task.priority = priority;
    }
    task.required_capabilities = params.required_capabilities;
    let task = scheduler::admit_task(&state, task).await?;
    Ok(serde_json::to_value(task).map_err(|e| MethodError::internal(e.to_string()))?)
}

#[derive(Deserialize)]
struct TaskIdParams {
    id: String,
}

async fn tasks_cancel(state: Arc<HubState>, params: Value, _client: u64) -> MethodResult {
    let params: TaskIdParams =
        serde_json::from_value(params).map_err(|e| MethodError::invalid(e.to_string()))?;
    let key = keys::task(&params.id);
    let Some(mut task) = state
        .kv
        .get_json::<Task>(&key)
        .map_err(|e| MethodError::internal(e.to_string()))?
    else {
        return Err(MethodError::not_found(format!("task {}", params.id)));
    };
    task.transition(TaskStatus::Cancelled)
        .map_err(|e| MethodError::invalid(e.to_string()))?;
    state
        .kv
        .set_json(&key, &task, None)
        .map_err(|e| MethodError::internal(e.to_string()))?;
    let _ = state.kv.zrem(&keys::task_queue(task.priority), &task.id);
    state.broadcast(
        "task.updated",
        serde_json::to_value(&task).unwrap_or(json!({})),
    );
    Ok(json!({ "id": task.id, "status": task.status }))
}

async fn tasks_list(state: Arc<HubState>, _params: Value, _client: u64) -> MethodResult {
    let mut tasks = Vec::new();
    for (_, bytes) in state
        .kv
        .scan_prefix("jarvis:task:")
        .map_err(|e| MethodError::internal(e.to_string()))?
    {
        // Anything under the prefix that does not parse as a Task (future
        // task-adjacent records) is skipped.
        if let Ok(task) = serde_json::from_slice::<Task>(&bytes) {
            tasks.push(task);
        }
    }
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(json!({ "tasks": tasks }))
}

// ── agents.* ──────────────────────────────────────────────────────────────────

async fn agents_list(state: Arc<HubState>, _params: Value, _client: u64) -> MethodResult {
    let agents: Vec<Value> = {
        let map = state.agents.read().expect("agent lock");
        map.values()
            .map(|entry| {
                let mut v = serde_json::to_value(&entry.state).unwrap_or(json!({}));
                v["capabilities"] = json!(entry.capabilities);
                v
            })
            .collect()
    };
    Ok(json!({ "agents": agents }))
}

#[derive(Deserialize)]
struct AgentMessageParams {
    to: String,
    content: String,
    #[serde(default, rename = "type")]
    kind: Option<AgentMessageKind>,
}

async fn agents_message(state: Arc<HubState>, params: Value, _client: u64) -> MethodResult {
    let params: AgentMessageParams =
        serde_json::from_value(params).map_err(|e| MethodError::invalid(e.to_string()))?;
    let known = state
        .agents
        .read()
        .expect("agent lock")
        .contains_key(&params.to);
    if !known {
        return Err(MethodError::not_found(format!("agent {}", params.to)));
    }
    let message = AgentMessage {
        id: uuid::Uuid::new_v4().to_string(),
        from: "dashboard".into(),
        to: params.to.clone(),
        kind: params.kind.unwrap_or(AgentMessageKind::Notification),
        content: params.content,
        priority: TaskPriority::Normal,
    };
    state
        .bus
        .publish_json(&subjects::agent_dm(&params.to), &message)
        .await
        .map_err(|e| MethodError::internal(e.to_string()))?;
    Ok(json!({ "delivered": true, "id": message.id }))
}

// ── channels.* ────────────────────────────────────────────────────────────────
//
// Channel adapters are external bus clients; the hub only holds their
// registration state in KV and forwards sends onto the chat subjects.

const CHANNELS_HASH: &str = "jarvis:channels";

async fn channels_list(state: Arc<HubState>, _params: Value, _client: u64) -> MethodResult {
    let all = state
        .kv
        .hgetall(CHANNELS_HASH)
        .map_err(|e| MethodError::internal(e.to_string()))?;
    let channels: Vec<Value> = all
        .iter()
        .filter_map(|(name, bytes)| {
            serde_json::from_slice::<Value>(bytes)
                .ok()
                .map(|status| json!({ "name": name, "status": status }))
        })
        .collect();
    Ok(json!({ "channels": channels }))
}

#[derive(Deserialize)]
struct ChannelSendParams {
    channel: String,
    message: String,
    #[serde(default)]
    to: Option<String>,
}

async fn channels_send(state: Arc<HubState>, params: Value, _client: u64) -> MethodResult {
    let params: ChannelSendParams =
        serde_json::from_value(params).map_err(|e| MethodError::invalid(e.to_string()))?;
    channel_registered(&state, &params.channel)?;
    state
        .bus
        .publish_json(
            &subjects::chat(&params.channel),
            &json!({ "to": params.to, "message": params.message }),
        )
        .await
        .map_err(|e| MethodError::internal(e.to_string()))?;
    Ok(json!({ "sent": true }))
}

#[derive(Deserialize)]
struct ChannelParams {
    channel: String,
}

async fn channels_status(state: Arc<HubState>, params: Value, _client: u64) -> MethodResult {
    let params: ChannelParams =
        serde_json::from_value(params).map_err(|e| MethodError::invalid(e.to_string()))?;
    channel_status(&state, &params.channel)
}

async fn channels_messages(state: Arc<HubState>, params: Value, _client: u64) -> MethodResult {
    let params: ChannelParams =
        serde_json::from_value(params).map_err(|e| MethodError::invalid(e.to_string()))?;
    channel_registered(&state, &params.channel)?;
    let history = state
        .kv
        .hget("jarvis:channel:history", &params.channel)
        .map_err(|e| MethodError::internal(e.to_string()))?
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .unwrap_or_else(|| json!([]));
    Ok(json!({ "messages": history }))
}

async fn channels_config(state: Arc<HubState>, params: Value, _client: u64) -> MethodResult {
    let params: ChannelParams =
        serde_json::from_value(params).map_err(|e| MethodError::invalid(e.to_string()))?;
    channel_registered(&state, &params.channel)?;
    let config = state
        .kv
        .hget("jarvis:channel:config", &params.channel)
        .map_err(|e| MethodError::internal(e.to_string()))?
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .unwrap_or_else(|| json!({}));
    Ok(json!({ "config": config }))
}

fn channel_registered(state: &HubState, channel: &str) -> Result<(), MethodError> {
    match state.kv.hget(CHANNELS_HASH, channel) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(MethodError::not_found(format!("channel {channel}"))),
        Err(e) => Err(MethodError::internal(e.to_string())),
    }
}

fn channel_status(state: &HubState, channel: &str) -> MethodResult {
    match state.kv.hget(CHANNELS_HASH, channel) {
        Ok(Some(bytes)) => Ok(serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| json!({ "available": true }))),
        Ok(None) => Ok(json!({ "available": false })),
        Err(e) => Err(MethodError::internal(e.to_string())),
    }
}

// ── imessage.* ────────────────────────────────────────────────────────────────
//
// Thin aliases over the imessage channel adapter's registration.

async fn imessage_status(state: Arc<HubState>, _params: Value, _client: u64) -> MethodResult {
    channel_status(&state, "imessage")
}

async fn imessage_send(state: Arc<HubState>, params: Value, client: u64) -> MethodResult {
    let mut params = params;
    params["channel"] = json!("imessage");
    channels_send(state, params, client).await
}

async fn imessage_messages(state: Arc<HubState>, _params: Value, client: u64) -> MethodResult {
    channels_messages(state, json!({ "channel": "imessage" }), client).await
}

// ── system.* ──────────────────────────────────────────────────────────────────

async fn system_metrics(state: Arc<HubState>, _params: Value, _client: u64) -> MethodResult {
    let mut tasks_by_status: HashMap<String, u64> = HashMap::new();
    for (_, bytes) in state
        .kv
        .scan_prefix("jarvis:task:")
        .map_err(|e| MethodError::internal(e.to_string()))?
    {
        if let Ok(task) = serde_json::from_slice::<Task>(&bytes) {
            let key = serde_json::to_value(task.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".into());
            *tasks_by_status.entry(key).or_default() += 1;
        }
    }
    let agents_by_status: HashMap<String, u64> = {
        let map = state.agents.read().expect("agent lock");
        let mut counts: HashMap<String, u64> = HashMap::new();
        for entry in map.values() {
            let key = serde_json::to_value(entry.state.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".into());
            *counts.entry(key).or_default() += 1;
        }
        counts
    };
    Ok(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "clients": state.clients.len(),
        "agents": agents_by_status,
        "tasks": tasks_by_status,
    }))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use jarvis_auth::{AuditLog, DashboardToken};
    use jarvis_bus::Broker;
    use jarvis_config::HubConfig;
    use jarvis_kv::Kv;

    async fn hub() -> (Broker, Arc<HubState>, MethodRegistry) {
        let broker = Broker::in_process();
        let state = Arc::new(HubState::new(
            HubConfig::default(),
            Kv::open_memory().unwrap(),
            broker.local_client(),
            DashboardToken::new("t"),
            AuditLog::disabled(),
        ));
        (broker, state, MethodRegistry::standard())
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (_b, state, registry) = hub().await;
        let err = registry
            .dispatch(state, "nope.nothing", json!({}), 1)
            .await
            .unwrap_err();
        assert_eq!(err.code, code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tasks_create_persists_and_queues() {
        let (_b, state, registry) = hub().await;
        let result = registry
            .dispatch(
                Arc::clone(&state),
                "tasks.create",
                json!({ "title": "sum 2+2", "requiredCapabilities": ["code"] }),
                1,
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "queued");
        assert_eq!(result["required_capabilities"][0], "code");

        let listed = registry
            .dispatch(state, "tasks.list", json!({}), 1)
            .await
            .unwrap();
        assert_eq!(listed["tasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tasks_create_rejects_empty_title() {
        let (_b, state, registry) = hub().await;
        let err = registry
            .dispatch(state, "tasks.create", json!({ "title": "  " }), 1)
            .await
            .unwrap_err();
        assert_eq!(err.code, code::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn tasks_cancel_respects_lifecycle() {
        let (_b, state, registry) = hub().await;
        let created = registry
            .dispatch(
                Arc::clone(&state),
                "tasks.create",
                json!({ "title": "t" }),
                1,
            )
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let cancelled = registry
            .dispatch(
                Arc::clone(&state),
                "tasks.cancel",
                json!({ "id": id }),
                1,
            )
            .await
            .unwrap();
        assert_eq!(cancelled["status"], "cancelled");

        // Terminal: a second cancel is an illegal transition.
        let err = registry
            .dispatch(state, "tasks.cancel", json!({ "id": id }), 1)
            .await
            .unwrap_err();
        assert_eq!(err.code, code::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn tasks_cancel_unknown_is_not_found() {
        let (_b, state, registry) = hub().await;
        let err = registry
            .dispatch(state, "tasks.cancel", json!({ "id": "ghost" }), 1)
            .await
            .unwrap_err();
        assert_eq!(err.code, code::NOT_FOUND);
    }

    #[tokio::test]
    async fn agents_message_to_unknown_agent_is_not_found() {
        let (_b, state, registry) = hub().await;
        let err = registry
            .dispatch(
                state,
                "agents.message",
                json!({ "to": "ghost", "content": "hi" }),
                1,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, code::NOT_FOUND);
    }

    #[tokio::test]
    async fn channels_send_requires_registration() {
        let (_b, state, registry) = hub().await;
        let err = registry
            .dispatch(
                Arc::clone(&state),
                "channels.send",
                json!({ "channel": "whatsapp", "message": "hello" }),
                1,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, code::NOT_FOUND);

        state
            .kv
            .hset(CHANNELS_HASH, "whatsapp", br#"{"connected":true}"#)
            .unwrap();
        let sent = registry
            .dispatch(
                state,
                "channels.send",
                json!({ "channel": "whatsapp", "message": "hello" }),
                1,
            )
            .await
            .unwrap();
        assert_eq!(sent["sent"], true);
    }

    #[tokio::test]
    async fn imessage_status_defaults_to_unavailable() {
        let (_b, state, registry) = hub().await;
        let status = registry
            .dispatch(state, "imessage.status", json!({}), 1)
            .await
            .unwrap();
        assert_eq!(status["available"], false);
    }

    #[tokio::test]
    async fn system_metrics_reports_counts() {
        let (_b, state, registry) = hub().await;
        registry
            .dispatch(
                Arc::clone(&state),
                "tasks.create",
                json!({ "title": "a" }),
                1,
            )
            .await
            .unwrap();
        let metrics = registry
            .dispatch(state, "system.metrics", json!({}), 1)
            .await
            .unwrap();
        assert_eq!(metrics["tasks"]["queued"], 1);
        assert_eq!(metrics["clients"], 0);
    }
}
