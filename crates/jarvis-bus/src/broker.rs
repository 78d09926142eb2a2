//! The subject broker, hosted by the hub process.
//!
//! Routing rules:
//! - Plain subscriptions each receive a copy of every matching message.
//! - Subscriptions sharing a queue-group name receive one-of-N (rotating).
//! - Patterns support `*` (exactly one token) and a trailing `>` (one or
//!   more tokens), dot-delimited.
//!
//! Slow consumers are not allowed to stall the broker: a full per-connection
//! outbox drops the frame for that connection with a warning.  Combined with
//! client reconnect this yields at-least-once delivery; handlers must be
//! idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::BusClient;
use crate::error::BusError;
use crate::frame::{read_frame, write_frame, BusFrame};

const OUTBOX_DEPTH: usize = 1024;

/// Whether `subject` matches `pattern` under bus wildcard rules.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut p = pattern.split('.');
    let mut s = subject.split('.');
    loop {
        match (p.next(), s.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(pt), Some(st)) => {
                if pt != "*" && pt != st {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct SubEntry {
    conn: u64,
    sid: u64,
    pattern: String,
    queue: Option<String>,
    outbox: mpsc::Sender<BusFrame>,
}

#[derive(Default)]
struct BrokerState {
    subs: Mutex<Vec<SubEntry>>,
    next_conn: AtomicU64,
    rr: AtomicU64,
    delivered: AtomicU64,
}

impl BrokerState {
    fn route(&self, subject: &str, reply: Option<&str>, payload: &[u8]) {
        let subs = self.subs.lock().expect("subs lock");
        let matching: Vec<&SubEntry> = subs
            .iter()
            .filter(|e| subject_matches(&e.pattern, subject))
            .collect();

        // Queue-group members grouped by name; one member per group receives.
        let mut groups: HashMap<&str, Vec<&SubEntry>> = HashMap::new();
        for entry in &matching {
            match entry.queue.as_deref() {
                Some(q) => groups.entry(q).or_default().push(entry),
                None => self.deliver(entry, subject, reply, payload),
            }
        }
        for members in groups.values() {
            let idx = self.rr.fetch_add(1, Ordering::Relaxed) as usize % members.len();
            self.deliver(members[idx], subject, reply, payload);
        }
    }

    fn deliver(&self, entry: &SubEntry, subject: &str, reply: Option<&str>, payload: &[u8]) {
        let frame = BusFrame::Msg {
            sid: entry.sid,
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload: payload.to_vec(),
        };
        match entry.outbox.try_send(frame) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => warn!(
                conn = entry.conn,
                sid = entry.sid,
                "slow consumer, dropping frame"
            ),
        }
    }

    fn drop_conn(&self, conn: u64) {
        self.subs.lock().expect("subs lock").retain(|e| e.conn != conn);
    }
}

/// The broker.  `bind` starts the TCP accept loop; `local_client` attaches an
/// in-process client over a duplex pipe (no TCP round-trip).
pub struct Broker {
    state: Arc<BrokerState>,
    local_addr: Option<std::net::SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl Broker {
    /// An in-process-only broker (no listener).
    pub fn in_process() -> Self {
        Self {
            state: Arc::new(BrokerState::default()),
            local_addr: None,
            accept_task: None,
        }
    }

    pub async fn bind(addr: &str) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BusError::Connect(format!("{addr}: {e}")))?;
        let local_addr = listener.local_addr().ok();
        let state = Arc::new(BrokerState::default());
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "bus client connected");
                        let _ = stream.set_nodelay(true);
                        spawn_conn(Arc::clone(&accept_state), stream);
                    }
                    Err(e) => {
                        warn!("bus accept error: {e}");
                        break;
                    }
                }
            }
        });
        if let Some(a) = local_addr {
            info!(addr = %a, "bus broker listening");
        }
        Ok(Self {
            state,
            local_addr,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// Total frames delivered since startup (metrics).
    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Relaxed)
    }

    /// Attach an in-process client.  No reconnect: the pipe lives as long as
    /// the broker.
    pub fn local_client(&self) -> BusClient {
        let (server_end, client_end) = tokio::io::duplex(crate::frame::MAX_FRAME_BYTES);
        spawn_conn(Arc::clone(&self.state), server_end);
        BusClient::from_stream(client_end)
    }

    /// Stop accepting new connections.  Existing connections drain on their
    /// own tasks.
    pub fn shutdown(&mut self) {
        if let Some(t) = self.accept_task.take() {
            t.abort();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_conn<S>(state: Arc<BrokerState>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<BusFrame>(OUTBOX_DEPTH);

    // Writer half: drain the outbox.
    tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    // Reader half: handle frames until the peer goes away.
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(BusFrame::Pub {
                    subject,
                    reply,
                    payload,
                }) => state.route(&subject, reply.as_deref(), &payload),
                Ok(BusFrame::Sub {
                    sid,
                    subject,
                    queue,
                }) => {
                    state.subs.lock().expect("subs lock").push(SubEntry {
                        conn,
                        sid,
                        pattern: subject,
                        queue,
                        outbox: outbox_tx.clone(),
                    });
                }
                Ok(BusFrame::Unsub { sid }) => {
                    state
                        .subs
                        .lock()
                        .expect("subs lock")
                        .retain(|e| !(e.conn == conn && e.sid == sid));
                }
                Ok(BusFrame::Ping) => {
                    let _ = outbox_tx.try_send(BusFrame::Pong);
                }
                Ok(BusFrame::Pong) | Ok(BusFrame::Msg { .. }) => {}
                Err(_) => break,
            }
        }
        state.drop_conn(conn);
        debug!(conn, "bus client disconnected");
    });
}

// ── Unit tests ────────────────────────────────────────────────────────────────
