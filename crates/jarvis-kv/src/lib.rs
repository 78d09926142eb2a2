// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Authoritative state store for the hub.
//!
//! A single SQLite database (WAL mode) holds three keyspaces: plain
//! key/value with optional TTL, hashes, and sorted sets.  JSON is the
//! default encoding for structured values — the typed helpers below pass
//! everything through `serde_json`.
//!
//! Operations are short synchronous calls on an internal connection lock;
//! nothing here suspends while the lock is held.  Channel pub/sub is an
//! in-process broadcast fan-out and does not persist.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

type Result<T> = std::result::Result<T, KvError>;

const CHANNEL_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Handle to the store.  Cheap to clone.
#[derive(Clone)]
pub struct Kv {
    conn: Arc<Mutex<Connection>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl Kv {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 key        TEXT PRIMARY KEY,
                 value      BLOB NOT NULL,
                 expires_at INTEGER
             );
             CREATE TABLE IF NOT EXISTS hashes (
                 key   TEXT NOT NULL,
                 field TEXT NOT NULL,
                 value BLOB NOT NULL,
                 PRIMARY KEY (key, field)
             );
             CREATE TABLE IF NOT EXISTS zsets (
                 key    TEXT NOT NULL,
                 member TEXT NOT NULL,
                 score  REAL NOT NULL,
                 PRIMARY KEY (key, member)
             );
             CREATE INDEX IF NOT EXISTS zsets_by_score ON zsets (key, score);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            channels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| KvError::Poisoned)
    }

    // ── Plain key/value ───────────────────────────────────────────────────────

    pub fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| now_ms() + t.as_millis() as i64);
        self.lock()?.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let row: Option<(Vec<u8>, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((_, Some(exp))) if exp <= now_ms() => {
                // Expired rows are invisible; the sweeper purges them later.
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    pub fn del(&self, key: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// `set` with a JSON-encoded value.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.set(key, &serde_json::to_vec(value)?, ttl)
    }

    /// `get` with JSON decoding.  A missing key is `Ok(None)`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All live `(key, value)` pairs whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE substr(key, 1, length(?1)) = ?1
               AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix, now_ms()], |r| Ok((r.get(0)?, r.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Hashes ────────────────────────────────────────────────────────────────

    pub fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO hashes (key, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, field) DO UPDATE SET value = ?3",
            params![key, field, value],
        )?;
        Ok(())
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()?
            .query_row(
                "SELECT value FROM hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT field, value FROM hashes WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |r| Ok((r.get(0)?, r.get(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (field, value): (String, Vec<u8>) = row?;
            out.insert(field, value);
        }
        Ok(out)
    }

    // ── Sorted sets ───────────────────────────────────────────────────────────

    pub fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO zsets (key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, member) DO UPDATE SET score = ?3",
            params![key, member, score],
        )?;
        Ok(())
    }

    /// Members ordered by ascending score, `start..=stop` by index
    /// (`stop = -1` means "to the end").
    pub fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT member FROM zsets WHERE key = ?1 ORDER BY score ASC, member ASC")?;
        let all: Vec<String> = stmt
            .query_map(params![key], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        let len = all.len() as i64;
        let lo = if start < 0 { (len + start).max(0) } else { start.min(len) };
        let hi = if stop < 0 { len + stop + 1 } else { (stop + 1).min(len) };
        if lo >= hi {
            return Ok(Vec::new());
        }
        Ok(all[lo as usize..hi as usize].to_vec())
    }

    pub fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let n = self.lock()?.execute(
            "DELETE FROM zsets WHERE key = ?1 AND member = ?2",
            params![key, member],
        )?;
        Ok(n > 0)
    }

    // ── Channel pub/sub ───────────────────────────────────────────────────────

    /// Publish to an in-process channel.  Returns the number of receivers.
    pub fn publish(&self, channel: &str, payload: Vec<u8>) -> usize {
        let senders = self.channels.lock().expect("channel map lock");
        match senders.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        let mut senders = self.channels.lock().expect("channel map lock");
        senders
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// Purge expired kv rows.  Called by the sweeper; safe to call any time.
    pub fn purge_expired(&self) -> Result<usize> {
        let n = self.lock()?.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_ms()],
        )?;
        if n > 0 {
            debug!(purged = n, "purged expired kv rows");
        }
        Ok(n)
    }

    /// Spawn the periodic TTL sweeper.  Abort the handle to stop it.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let kv = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = kv.purge_expired() {
                    warn!("kv sweep failed: {e}");
                }
            }
        })
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_round_trip() {
        let kv = Kv::open_memory().unwrap();
        kv.set("k", b"v", None).unwrap();
        assert_eq!(kv.get("k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn get_missing_is_none() {
        let kv = Kv::open_memory().unwrap();
        assert!(kv.get("nope").unwrap().is_none());
    }

    #[test]
    fn set_overwrites() {
        let kv = Kv::open_memory().unwrap();
        kv.set("k", b"1", None).unwrap();
        kv.set("k", b"2", None).unwrap();
        assert_eq!(kv.get("k").unwrap().unwrap(), b"2");
    }

    #[test]
    fn del_reports_existence() {
        let kv = Kv::open_memory().unwrap();
        kv.set("k", b"v", None).unwrap();
        assert!(kv.del("k").unwrap());
        assert!(!kv.del("k").unwrap());
        assert!(kv.get("k").unwrap().is_none());
    }

    #[test]
    fn expired_value_is_invisible() {
        let kv = Kv::open_memory().unwrap();
        kv.set("k", b"v", Some(Duration::from_millis(0))).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(kv.get("k").unwrap().is_none());
    }

    #[test]
    fn unexpired_ttl_value_is_visible() {
        let kv = Kv::open_memory().unwrap();
        kv.set("k", b"v", Some(Duration::from_secs(60))).unwrap();
        assert!(kv.get("k").unwrap().is_some());
    }

    #[test]
    fn purge_removes_expired_rows() {
        let kv = Kv::open_memory().unwrap();
        kv.set("dead", b"v", Some(Duration::from_millis(0))).unwrap();
        kv.set("live", b"v", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let purged = kv.purge_expired().unwrap();
        assert_eq!(purged, 1);
        assert!(kv.get("live").unwrap().is_some());
    }

    #[test]
    fn json_helpers_round_trip() {
        let kv = Kv::open_memory().unwrap();
        kv.set_json("cfg", &json!({"a": 1}), None).unwrap();
        let v: serde_json::Value = kv.get_json("cfg").unwrap().unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn scan_prefix_returns_matching_live_keys() {
        let kv = Kv::open_memory().unwrap();
        kv.set("jarvis:task:a", b"1", None).unwrap();
        kv.set("jarvis:task:b", b"2", None).unwrap();
        kv.set("jarvis:agent:x", b"3", None).unwrap();
        kv.set("jarvis:task:dead", b"4", Some(Duration::from_millis(0)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let hits = kv.scan_prefix("jarvis:task:").unwrap();
        let keys: Vec<&str> = hits.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["jarvis:task:a", "jarvis:task:b"]);
    }

    #[test]
    fn hash_operations() {
        let kv = Kv::open_memory().unwrap();
        kv.hset("h", "f1", b"1").unwrap();
        kv.hset("h", "f2", b"2").unwrap();
        kv.hset("h", "f1", b"updated").unwrap();
        assert_eq!(kv.hget("h", "f1").unwrap().unwrap(), b"updated");
        assert!(kv.hget("h", "missing").unwrap().is_none());
        let all = kv.hgetall("h").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["f2"], b"2");
    }

    #[test]
    fn zset_orders_by_score() {
        let kv = Kv::open_memory().unwrap();
        kv.zadd("q", "c", 3.0).unwrap();
        kv.zadd("q", "a", 1.0).unwrap();
        kv.zadd("q", "b", 2.0).unwrap();
        assert_eq!(kv.zrange("q", 0, -1).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(kv.zrange("q", 0, 0).unwrap(), vec!["a"]);
        assert_eq!(kv.zrange("q", 1, 2).unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn zadd_updates_score() {
        let kv = Kv::open_memory().unwrap();
        kv.zadd("q", "a", 1.0).unwrap();
        kv.zadd("q", "b", 2.0).unwrap();
        kv.zadd("q", "a", 9.0).unwrap();
        assert_eq!(kv.zrange("q", 0, -1).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn zrem_removes_member() {
        let kv = Kv::open_memory().unwrap();
        kv.zadd("q", "a", 1.0).unwrap();
        assert!(kv.zrem("q", "a").unwrap());
        assert!(!kv.zrem("q", "a").unwrap());
        assert!(kv.zrange("q", 0, -1).unwrap().is_empty());
    }

    #[test]
    fn zrange_empty_key_is_empty() {
        let kv = Kv::open_memory().unwrap();
        assert!(kv.zrange("nothing", 0, -1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let kv = Kv::open_memory().unwrap();
        let mut rx1 = kv.subscribe("events");
        let mut rx2 = kv.subscribe("events");
        let n = kv.publish("events", b"hello".to_vec());
        assert_eq!(n, 2);
        assert_eq!(rx1.recv().await.unwrap(), b"hello");
        assert_eq!(rx2.recv().await.unwrap(), b"hello");
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let kv = Kv::open_memory().unwrap();
        assert_eq!(kv.publish("empty", b"x".to_vec()), 0);
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let kv = Kv::open(&path).unwrap();
            kv.set("durable", b"yes", None).unwrap();
        }
        let kv = Kv::open(&path).unwrap();
        assert_eq!(kv.get("durable").unwrap().unwrap(), b"yes");
    }
}
