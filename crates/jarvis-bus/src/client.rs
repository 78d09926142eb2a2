//! Reconnecting bus client.
//!
//! All socket I/O lives on one spawned task; the public handle talks to it
//! over a command channel.  On connection loss the task redials with
//! exponential backoff (capped at 30 s) and replays the full subscription set
//! before resuming, so subscribers only observe a gap, never a silent
//! unsubscribe.  Publishes issued while disconnected wait in the command
//! channel and apply backpressure to the caller once it fills.

use std::collections::HashMap;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::BusError;
use crate::frame::{read_frame, write_frame, BusFrame};

/// Default request/reply timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const CMD_DEPTH: usize = 1024;
const SUB_DEPTH: usize = 1024;
const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

enum Cmd {
    Publish {
        subject: String,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Subscribe {
        subject: String,
        queue: Option<String>,
        tx: mpsc::Sender<BusMessage>,
        sid_tx: oneshot::Sender<u64>,
    },
    Unsubscribe {
        sid: u64,
    },
}

/// Handle to the bus.  Cheap to clone; dropping every handle closes the
/// connection.
#[derive(Clone)]
pub struct BusClient {
    cmd_tx: mpsc::Sender<Cmd>,
}

/// One open subscription.  Dropping it unsubscribes.
pub struct Subscription {
    sid: u64,
    rx: mpsc::Receiver<BusMessage>,
    cmd_tx: mpsc::Sender<Cmd>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cmd_tx.try_send(Cmd::Unsubscribe { sid: self.sid });
    }
}

impl BusClient {
    /// Connect to a broker at `addr` (`host:port`).  The connection is
    /// established lazily by the I/O task, which also owns reconnects, so
    /// this never fails — a broker that is briefly down is indistinguishable
    /// from a reconnect.
    pub fn connect(addr: impl Into<String>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_DEPTH);
        tokio::spawn(io_task(Transport::Tcp(addr.into()), cmd_rx));
        Self { cmd_tx }
    }

    /// Wrap an already-established stream (in-process duplex).  No reconnect.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_DEPTH);
        tokio::spawn(io_task(Transport::Stream(Some(Box::new(stream))), cmd_rx));
        Self { cmd_tx }
    }

    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.cmd_tx
            .send(Cmd::Publish {
                subject: subject.to_string(),
                reply: None,
                payload,
            })
            .await
            .map_err(|_| BusError::Closed)
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        subject: &str,
        value: &T,
    ) -> Result<(), BusError> {
        self.publish(subject, serde_json::to_vec(value)?).await
    }

    pub async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        self.subscribe_inner(subject, None).await
    }

    /// Subscribe as a member of `queue`: one member of the group receives
    /// each matching message.
    pub async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
    ) -> Result<Subscription, BusError> {
        self.subscribe_inner(subject, Some(queue.to_string())).await
    }

    async fn subscribe_inner(
        &self,
        subject: &str,
        queue: Option<String>,
    ) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUB_DEPTH);
        let (sid_tx, sid_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Subscribe {
                subject: subject.to_string(),
                queue,
                tx,
                sid_tx,
            })
            .await
            .map_err(|_| BusError::Closed)?;
        let sid = sid_rx.await.map_err(|_| BusError::Closed)?;
        Ok(Subscription {
            sid,
            rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Publish and await one reply on a private inbox subject.
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let inbox = format!("_inbox.{}", uuid::Uuid::new_v4().simple());
        let mut sub = self.subscribe(&inbox).await?;
        self.cmd_tx
            .send(Cmd::Publish {
                subject: subject.to_string(),
                reply: Some(inbox),
                payload,
            })
            .await
            .map_err(|_| BusError::Closed)?;
        match tokio::time::timeout(timeout, sub.recv()).await {
            Ok(Some(msg)) => Ok(msg.payload),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// JSON request/reply with the default 5 s timeout.
    pub async fn request_json<Q: Serialize, R: DeserializeOwned>(
        &self,
        subject: &str,
        query: &Q,
    ) -> Result<R, BusError> {
        let bytes = self
            .request(subject, serde_json::to_vec(query)?, REQUEST_TIMEOUT)
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Reply to a request message.  A message without a reply subject is a
    /// plain publish and is ignored here.
    pub async fn respond(&self, msg: &BusMessage, payload: Vec<u8>) -> Result<(), BusError> {
        match &msg.reply {
            Some(reply) => self.publish(reply, payload).await,
            None => Ok(()),
        }
    }
}

// ── I/O task ──────────────────────────────────────────────────────────────────

enum Transport {
    Tcp(String),
    Stream(Option<Box<dyn DuplexStream>>),
}

trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<S: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for S {}

struct SubState {
    subject: String,
    queue: Option<String>,
    tx: mpsc::Sender<BusMessage>,
}

async fn io_task(mut transport: Transport, mut cmd_rx: mpsc::Receiver<Cmd>) {
    let mut subs: HashMap<u64, SubState> = HashMap::new();
    let mut next_sid: u64 = 1;
    let mut backoff = BACKOFF_START;

    'reconnect: loop {
        let stream: Box<dyn DuplexStream> = match &mut transport {
            Transport::Stream(slot) => match slot.take() {
                Some(s) => s,
                // A fixed stream cannot reconnect; drain commands and stop.
                None => return,
            },
            Transport::Tcp(addr) => match TcpStream::connect(addr.as_str()).await {
                Ok(s) => {
                    let _ = s.set_nodelay(true);
                    backoff = BACKOFF_START;
                    Box::new(s)
                }
                Err(e) => {
                    debug!(addr = %addr, "bus dial failed, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue 'reconnect;
                }
            },
        };

        let (mut reader, mut writer) = tokio::io::split(stream);

        // Reader side-task: length-prefixed reads are not cancel-safe inside
        // select!, so frames flow through a channel instead.
        let (frame_tx, mut frame_rx) = mpsc::channel::<BusFrame>(SUB_DEPTH);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Replay the subscription set on the fresh connection.
        let mut replay_failed = false;
        for (sid, sub) in &subs {
            let frame = BusFrame::Sub {
                sid: *sid,
                subject: sub.subject.clone(),
                queue: sub.queue.clone(),
            };
            if write_frame(&mut writer, &frame).await.is_err() {
                replay_failed = true;
                break;
            }
        }
        if replay_failed {
            reader_task.abort();
            continue 'reconnect;
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => {
                        // Every client handle dropped: we are done.
                        reader_task.abort();
                        return;
                    }
                    Some(Cmd::Publish { subject, reply, payload }) => {
                        let frame = BusFrame::Pub { subject, reply, payload };
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Cmd::Subscribe { subject, queue, tx, sid_tx }) => {
                        let sid = next_sid;
                        next_sid += 1;
                        let frame = BusFrame::Sub {
                            sid,
                            subject: subject.clone(),
                            queue: queue.clone(),
                        };
                        subs.insert(sid, SubState { subject, queue, tx });
                        let _ = sid_tx.send(sid);
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Cmd::Unsubscribe { sid }) => {
                        subs.remove(&sid);
                        if write_frame(&mut writer, &BusFrame::Unsub { sid }).await.is_err() {
                            break;
                        }
                    }
                },
                frame = frame_rx.recv() => match frame {
                    None => break, // connection lost
                    Some(BusFrame::Msg { sid, subject, reply, payload }) => {
                        if let Some(sub) = subs.get(&sid) {
                            let msg = BusMessage { subject, reply, payload };
                            if sub.tx.try_send(msg).is_err() {
                                warn!(sid, "subscription backlog full, dropping message");
                            }
                        }
                    }
                    Some(BusFrame::Ping) => {
                        if write_frame(&mut writer, &BusFrame::Pong).await.is_err() {
                            break;
                        }
                    }
                    Some(_) => {}
                },
            }
        }

        reader_task.abort();
        // Drop subscriptions whose receivers are gone before replaying.
        subs.retain(|_, s| !s.tx.is_closed());
        debug!("bus connection lost, reconnecting");
    }
}
