// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-source authentication lockout.
//!
//! Each failed auth attempt increments a counter for its source (an IP or a
//! source id) inside a 5-minute window.  Reaching 5 failures locks the source
//! out for 15 minutes — while locked, attempts are rejected *before* any
//! token comparison.  The table is capped at 10 000 entries with
//! oldest-eviction and swept every 5 minutes so sustained scanning traffic
//! cannot grow it without bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);
pub const MAX_FAILURES: u32 = 5;
pub const MAX_ENTRIES: usize = 10_000;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct SourceEntry {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
    last_seen: Instant,
}

/// Tracks auth failures per source.  Cheap to clone (shared state).
#[derive(Clone)]
pub struct LockoutTracker {
    inner: Arc<Mutex<HashMap<String, SourceEntry>>>,
}

impl Default for LockoutTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LockoutTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `true` if `source` is currently locked out.  Must be checked before
    /// any token comparison.
    pub fn is_locked(&self, source: &str) -> bool {
        self.is_locked_at(source, Instant::now())
    }

    /// Record a failed attempt.  Returns `true` if this failure triggered a
    /// lockout.
    pub fn record_failure(&self, source: &str) -> bool {
        self.record_failure_at(source, Instant::now())
    }

    /// A successful auth clears the source's failure history.
    pub fn record_success(&self, source: &str) {
        self.inner.lock().unwrap().remove(source);
    }

    /// Drop entries whose window and lockout have both expired.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// Spawn the periodic sweeper.  Abort the returned handle to destroy it.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await; // the first tick fires immediately
            loop {
                tick.tick().await;
                tracker.sweep();
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    // ── Clock-injected internals (directly exercised by tests) ───────────────

    fn is_locked_at(&self, source: &str, now: Instant) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.get_mut(source) {
            Some(entry) => match entry.locked_until {
                Some(until) if now < until => true,
                Some(_) => {
                    // Lockout expired; start fresh.
                    map.remove(source);
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    fn record_failure_at(&self, source: &str, now: Instant) -> bool {
        let mut map = self.inner.lock().unwrap();

        if map.len() >= MAX_ENTRIES && !map.contains_key(source) {
            evict_oldest(&mut map);
        }

        let entry = map.entry(source.to_string()).or_insert(SourceEntry {
            failures: 0,
            window_start: now,
            locked_until: None,
            last_seen: now,
        });
        entry.last_seen = now;

        // Window expired: restart the count.
        if now.duration_since(entry.window_start) > FAILURE_WINDOW {
            entry.failures = 0;
            entry.window_start = now;
        }

        entry.failures += 1;
        if entry.failures >= MAX_FAILURES && entry.locked_until.is_none() {
            entry.locked_until = Some(now + LOCKOUT_DURATION);
            warn!(source, failures = entry.failures, "source locked out");
            return true;
        }
        debug!(source, failures = entry.failures, "auth failure recorded");
        false
    }

    fn sweep_at(&self, now: Instant) {
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, e| {
            let lock_live = e.locked_until.is_some_and(|until| now < until);
            let window_live = now.duration_since(e.window_start) <= FAILURE_WINDOW;
            lock_live || window_live
        });
    }
}

fn evict_oldest(map: &mut HashMap<String, SourceEntry>) {
    if let Some(oldest) = map
        .iter()
        .min_by_key(|(_, e)| e.last_seen)
        .map(|(k, _)| k.clone())
    {
        map.remove(&oldest);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
