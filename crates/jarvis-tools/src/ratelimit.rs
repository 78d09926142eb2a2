// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Token-bucket rate limiter for tool calls.
//!
//! Each key owns a bucket of capacity `N` refilled continuously at
//! `N / 60 000` tokens per millisecond (i.e. `N` calls per minute).  Elapsed
//! time between refills is clamped to `[0, 120 000]` ms so clock drift can
//! neither empty nor flood a bucket.  The bucket map is capped at 50 000
//! entries with oldest-eviction and swept every 5 minutes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::warn;

pub const MAX_BUCKETS: usize = 50_000;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Buckets idle longer than this are reclaimed by the sweep.
pub const STALE_AFTER: Duration = Duration::from_secs(10 * 60);
const ELAPSED_CLAMP_MS: f64 = 120_000.0;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
    last_used: Instant,
}

/// Shared limiter handle.  `destroy()` (or dropping the sweeper handle)
/// cancels the background sweep, so tests can build and tear down limiters
/// freely.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, Bucket>>>,
    capacity: u32,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RateLimiter {
    /// `capacity` calls per key per minute.
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    /// Take one token for `key`.  `false` means the caller is rate limited.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    /// Start the periodic sweeper (idempotent).
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let limiter = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                limiter.sweep();
            }
        }));
    }

    /// Cancel the sweep task.  Buckets remain usable.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    // ── Clock-injected internals ──────────────────────────────────────────────

    fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.inner.lock().unwrap();

        if buckets.len() >= MAX_BUCKETS && !buckets.contains_key(key) {
            if let Some(oldest) = buckets
                .iter()
                .min_by_key(|(_, b)| b.last_used)
                .map(|(k, _)| k.clone())
            {
                buckets.remove(&oldest);
                warn!(evicted = %oldest, "rate limiter at capacity, evicted oldest bucket");
            }
        }

        let capacity = self.capacity as f64;
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            refilled_at: now,
            last_used: now,
        });

        let elapsed_ms = now
            .saturating_duration_since(bucket.refilled_at)
            .as_millis() as f64;
        let elapsed_ms = elapsed_ms.clamp(0.0, ELAPSED_CLAMP_MS);
        bucket.tokens = (bucket.tokens + elapsed_ms * capacity / 60_000.0).min(capacity);
        bucket.refilled_at = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn sweep_at(&self, now: Instant) {
        self.inner
            .lock()
            .unwrap()
            .retain(|_, b| now.saturating_duration_since(b.last_used) < STALE_AFTER);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
