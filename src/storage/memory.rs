//! In-process counter store.
//!
//! State is two maps behind a single reader/writer lock: bucket state by
//! key, and block expiry by key. Reads return value snapshots and never
//! block each other; every mutation takes the writer lock, which is what
//! makes `increment` linearizable per key. A background sweeper removes
//! expired blocks and stale buckets; `close` stops it deterministically.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{now_unix_ms, BucketState, CounterStore};
use crate::error::Result;
use crate::ratelimit::kind_from_key;

/// How often the sweeper wakes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Buckets are kept for this many windows past their start before sweeping.
const BUCKET_GRACE_WINDOWS: i64 = 2;

#[derive(Default)]
struct Maps {
    buckets: HashMap<String, BucketState>,
    blocks: HashMap<String, i64>,
}

/// Process-local counter store.
pub struct MemoryStore {
    maps: Arc<RwLock<Maps>>,
    shutdown: Arc<Notify>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create the store and start its sweeper task.
    pub fn new() -> Self {
        let maps = Arc::new(RwLock::new(Maps::default()));
        let shutdown = Arc::new(Notify::new());

        let sweeper_maps = maps.clone();
        let sweeper_shutdown = shutdown.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            // The first tick fires immediately; skip it so a freshly
            // created store does not sweep before any traffic.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = sweeper_shutdown.notified() => break,
                    _ = interval.tick() => {
                        let (blocks, buckets) = Self::sweep(&sweeper_maps);
                        if blocks > 0 || buckets > 0 {
                            debug!(
                                removed_blocks = blocks,
                                removed_buckets = buckets,
                                "Memory store sweep completed"
                            );
                        }
                    }
                }
            }
        });

        info!("Memory store initialized");

        Self {
            maps,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// One sweep pass: drop expired blocks and buckets whose window ended
    /// more than `BUCKET_GRACE_WINDOWS` windows ago. Returns the removal
    /// counts.
    fn sweep(maps: &RwLock<Maps>) -> (usize, usize) {
        let now = now_unix_ms();
        let mut guard = maps.write();

        let blocks_before = guard.blocks.len();
        guard.blocks.retain(|_, blocked_until| *blocked_until > now);
        let removed_blocks = blocks_before - guard.blocks.len();

        let buckets_before = guard.buckets.len();
        guard.buckets.retain(|_, state| {
            state.window_secs == 0
                || state.window_start_ms + BUCKET_GRACE_WINDOWS * state.window_secs as i64 * 1000
                    >= now
        });
        let removed_buckets = buckets_before - guard.buckets.len();

        (removed_blocks, removed_buckets)
    }

    /// Number of live bucket entries. Test hook.
    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.maps.read().buckets.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<BucketState>> {
        let guard = self.maps.read();
        Ok(guard.buckets.get(key).cloned())
    }

    async fn increment(&self, key: &str, limit: u64, window: Duration) -> Result<(u64, i64)> {
        let now = now_unix_ms();
        let window_ms = window.as_millis() as i64;
        let mut guard = self.maps.write();

        let state = guard
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState {
                key: key.to_string(),
                kind: kind_from_key(key).unwrap_or_default(),
                count: 0,
                limit,
                window_secs: window.as_secs(),
                window_start_ms: now,
                blocked: false,
                blocked_until_ms: None,
            });

        // Reopen the window if it has elapsed.
        if now - state.window_start_ms >= window_ms {
            state.count = 0;
            state.window_start_ms = now;
            state.blocked = false;
            state.blocked_until_ms = None;
        }

        state.count += 1;
        state.limit = limit;
        state.window_secs = window.as_secs();

        if state.count > limit {
            state.blocked = true;
        }

        let result = (state.count, state.window_start_ms);
        if result.0 == 1 {
            // Window reopened; any standalone block marker is stale now.
            guard.blocks.remove(key);
        }
        Ok(result)
    }

    async fn is_blocked(&self, key: &str) -> Result<(bool, Option<i64>)> {
        let now = now_unix_ms();

        {
            let guard = self.maps.read();
            if let Some(&blocked_until) = guard.blocks.get(key) {
                if now < blocked_until {
                    return Ok((true, Some(blocked_until)));
                }
            } else {
                match guard.buckets.get(key) {
                    Some(state) if state.blocked => {
                        // A blocked bucket with no expiry holds until the
                        // end of its current window.
                        let until = state.blocked_until_ms.unwrap_or_else(|| state.window_end_ms());
                        if now < until {
                            return Ok((true, Some(until)));
                        }
                    }
                    _ => return Ok((false, None)),
                }
            }
        }

        // An expired marker was observed; clear it lazily.
        let mut guard = self.maps.write();
        if let Some(&blocked_until) = guard.blocks.get(key) {
            if now < blocked_until {
                return Ok((true, Some(blocked_until)));
            }
            guard.blocks.remove(key);
        }
        if let Some(state) = guard.buckets.get_mut(key) {
            if state.blocked {
                let until = state.blocked_until_ms.unwrap_or_else(|| state.window_end_ms());
                if now < until {
                    return Ok((true, Some(until)));
                }
                state.blocked = false;
                state.blocked_until_ms = None;
            }
        }
        Ok((false, None))
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let now = now_unix_ms();
        let blocked_until = now + duration.as_millis() as i64;
        let mut guard = self.maps.write();

        guard.blocks.insert(key.to_string(), blocked_until);

        match guard.buckets.get_mut(key) {
            Some(state) => {
                state.blocked = true;
                state.blocked_until_ms = Some(blocked_until);
            }
            None => {
                let mut state = BucketState::fresh(key, 0, Duration::ZERO);
                state.blocked = true;
                state.blocked_until_ms = Some(blocked_until);
                guard.buckets.insert(key.to_string(), state);
            }
        }

        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut guard = self.maps.write();
        guard.buckets.remove(key);
        guard.blocks.remove(key);
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let guard = self.maps.read();
        debug!(
            bucket_entries = guard.buckets.len(),
            block_entries = guard.blocks.len(),
            "Memory store health check"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            self.shutdown.notify_one();
            let _ = handle.await;
        }

        let mut guard = self.maps.write();
        guard.buckets.clear();
        guard.blocks.clear();
        info!("Memory store closed");
        Ok(())
    }
}
