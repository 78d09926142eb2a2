// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use jarvis_auth::{AuditLog, DashboardToken, LockoutTracker};
use jarvis_bus::BusClient;
use jarvis_config::HubConfig;
use jarvis_kv::Kv;
use jarvis_proto::{AgentState, Frame};

/// One connected WebSocket client.
pub struct ClientHandle {
    pub outbox: mpsc::Sender<Frame>,
}

/// The hub's view of one agent, cached from KV for scheduling decisions.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub state: AgentState,
    pub capabilities: Vec<String>,
    /// Epoch millis of the last task handed to this agent (scheduler
    /// tie-break).
    pub last_assignment_ms: i64,
}

/// Shared hub state.  The hub is the only writer for agent and task state in
/// the KV; agents publish intents on the bus and the consumers here
/// serialize them.
pub struct HubState {
    pub config: HubConfig,
    pub kv: Kv,
    /// Local client on the embedded broker.
    pub bus: BusClient,
    pub clients: DashMap<u64, ClientHandle>,
    pub agents: RwLock<std::collections::HashMap<String, AgentEntry>>,
    pub token: DashboardToken,
    pub lockout: LockoutTracker,
    pub audit: AuditLog,
    pub started_at: Instant,
    next_client: AtomicU64,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        kv: Kv,
        bus: BusClient,
        token: DashboardToken,
        audit: AuditLog,
    ) -> Self {
        Self {
            config,
            kv,
            bus,
            clients: DashMap::new(),
            agents: RwLock::new(std::collections::HashMap::new()),
            token,
            lockout: LockoutTracker::new(),
            audit,
            started_at: Instant::now(),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    /// Fan one event out to every live client.  Slow clients shed frames.
    pub fn broadcast(&self, event: &str, payload: Value) {
        let frame = Frame::event(event, payload);
        for entry in self.clients.iter() {
            let _ = entry.value().outbox.try_send(frame.clone());
        }
        debug!(event, clients = self.clients.len(), "event broadcast");
    }

    /// Targeted event to one client.  `false` when the client is gone.
    pub fn send_event(&self, client_id: u64, event: &str, payload: Value) -> bool {
        match self.clients.get(&client_id) {
            Some(client) => client
                .outbox
                .try_send(Frame::event(event, payload))
                .is_ok(),
            None => false,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use jarvis_bus::Broker;
    use serde_json::json;

    async fn state() -> (Broker, HubState) {
        let broker = Broker::in_process();
        let bus = broker.local_client();
        let state = HubState::new(
            HubConfig::default(),
            Kv::open_memory().unwrap(),
            bus,
            DashboardToken::new("t"),
            AuditLog::disabled(),
        );
        (broker, state)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client_identically() {
        let (_broker, state) = state().await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        state.clients.insert(1, ClientHandle { outbox: tx1 });
        state.clients.insert(2, ClientHandle { outbox: tx2 });

        state.broadcast("task.updated", json!({"id": "t1"}));

        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        assert_eq!(f1.encode(), f2.encode(), "identical payloads");
    }

    #[tokio::test]
    async fn send_event_targets_one_client() {
        let (_broker, state) = state().await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        state.clients.insert(1, ClientHandle { outbox: tx1 });
        state.clients.insert(2, ClientHandle { outbox: tx2 });

        assert!(state.send_event(1, "agent.updated", json!({})));
        assert!(rx1.recv().await.is_some());
        assert!(rx2.try_recv().is_err());
        assert!(!state.send_event(99, "agent.updated", json!({})));
    }

    #[tokio::test]
    async fn client_ids_are_unique() {
        let (_broker, state) = state().await;
        assert_ne!(state.next_client_id(), state.next_client_id());
    }
}
