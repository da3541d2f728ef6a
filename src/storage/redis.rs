//! Redis-backed counter store.
//!
//! One key per bucket holds the JSON-encoded [`BucketState`] with a TTL at
//! least as long as the remaining window. The increment is a single Lua
//! script evaluated server-side, which is what makes it linearizable with
//! respect to the other write operations on the same key.

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{now_unix_ms, BucketState, CounterStore, RedisConfig};
use crate::error::{GatekeeperError, Result};

/// Upper bound on pooled connections.
const POOL_SIZE: usize = 20;
/// Deadline for the initial connectivity probe.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for read operations.
const READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for write operations.
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for checking a connection out of the pool.
const POOL_WAIT_TIMEOUT: Duration = Duration::from_secs(4);
/// Extra attempts to check out a connection on transient pool errors.
const POOL_RETRIES: usize = 2;
/// Slack added to a block's TTL so the marker outlives its expiry.
const BLOCK_TTL_SLACK_SECS: u64 = 60;

/// Atomic window-scoped increment.
///
/// Reads the encoded state, reopens the window if elapsed, increments,
/// marks the bucket blocked on overflow, recomputes a TTL no shorter than
/// the remaining window (or remaining block), and writes back. Returns
/// `{new_count, window_start_ms}`.
const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_secs = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])

local raw = redis.call('GET', key)
local state
if raw then
    state = cjson.decode(raw)
else
    state = {
        key = key,
        kind = string.match(key, '^rate_limit:([^:]+):') or 'address',
        count = 0,
        limit = limit,
        window_secs = window_secs,
        window_start_ms = now_ms,
        blocked = false,
    }
end

if now_ms - state.window_start_ms >= window_secs * 1000 then
    state.count = 0
    state.window_start_ms = now_ms
    state.blocked = false
    state.blocked_until_ms = nil
end

state.count = state.count + 1
state.limit = limit
state.window_secs = window_secs

if state.count > limit then
    state.blocked = true
end

local ttl = window_secs - math.floor((now_ms - state.window_start_ms) / 1000)
if ttl <= 0 then
    ttl = window_secs
end
if state.blocked_until_ms and state.blocked_until_ms > now_ms then
    local block_ttl = math.ceil((state.blocked_until_ms - now_ms) / 1000)
    if block_ttl > ttl then
        ttl = block_ttl
    end
end

redis.call('SET', key, cjson.encode(state), 'EX', ttl)
return {state.count, state.window_start_ms}
"#;

/// Shared counter store backed by Redis.
pub struct RedisStore {
    pool: Pool,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> GatekeeperError {
    GatekeeperError::StoreUnavailable(format!("{}: {}", context, err))
}

fn timed_out(context: &str) -> GatekeeperError {
    GatekeeperError::StoreUnavailable(format!("{} timed out", context))
}

impl RedisStore {
    /// Build the pool and probe the server with a PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let mut pool_config = deadpool_redis::Config::from_url(config.url());
        // deadpool exposes no min-idle knob; only the ceiling is bounded,
        // and recycled connections serve as the warm floor.
        let mut sizing = deadpool_redis::PoolConfig::new(POOL_SIZE);
        sizing.timeouts.wait = Some(POOL_WAIT_TIMEOUT);
        sizing.timeouts.create = Some(CONNECT_TIMEOUT);
        pool_config.pool = Some(sizing);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| unavailable("failed to create redis pool", e))?;

        let mut conn = timeout(CONNECT_TIMEOUT, pool.get())
            .await
            .map_err(|_| timed_out("redis connect"))?
            .map_err(|e| unavailable("failed to connect to redis", e))?;

        timeout(
            CONNECT_TIMEOUT,
            redis::cmd("PING").query_async::<_, String>(&mut *conn),
        )
        .await
        .map_err(|_| timed_out("redis ping"))?
        .map_err(|e| unavailable("redis ping failed", e))?;

        info!(host = %config.host, port = config.port, db = config.db, "Redis connection established");

        Ok(Self {
            pool,
            closed: AtomicBool::new(false),
        })
    }

    /// Check a connection out of the pool, retrying transient pool errors.
    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(GatekeeperError::StoreUnavailable("redis store is closed".into()));
        }

        let mut last_err = None;
        for attempt in 0..=POOL_RETRIES {
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    if attempt < POOL_RETRIES {
                        debug!(attempt = attempt + 1, error = %e, "Retrying redis checkout");
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(unavailable(
            "failed to get redis connection",
            last_err.expect("at least one attempt was made"),
        ))
    }

    /// Decode a persisted bucket, enforcing the state invariants.
    fn decode(key: &str, raw: &str) -> Result<BucketState> {
        let state: BucketState = serde_json::from_str(raw).map_err(|e| {
            GatekeeperError::StoreInconsistent(format!("failed to decode state for {}: {}", key, e))
        })?;
        if state.blocked_until_ms.is_some() && !state.blocked {
            return Err(GatekeeperError::StoreInconsistent(format!(
                "bucket {} carries a block expiry without being blocked",
                key
            )));
        }
        Ok(state)
    }

    /// Write a bucket back with the given TTL in seconds.
    async fn write_state(&self, key: &str, state: &BucketState, ttl_secs: u64) -> Result<()> {
        let encoded = serde_json::to_string(state).map_err(|e| {
            GatekeeperError::StoreInconsistent(format!("failed to encode state for {}: {}", key, e))
        })?;
        let mut conn = self.conn().await?;
        timeout(
            WRITE_TIMEOUT,
            conn.set_ex::<_, _, ()>(key, encoded, ttl_secs.max(1)),
        )
        .await
        .map_err(|_| timed_out("redis write"))?
        .map_err(|e| unavailable("failed to write state", e))?;
        Ok(())
    }

    /// Clear an expired block marker, dropping the key entirely when its
    /// window has also elapsed.
    async fn clear_block(&self, key: &str, mut state: BucketState) -> Result<()> {
        let now = now_unix_ms();
        if now >= state.window_end_ms() {
            return self.reset_key(key).await;
        }
        state.blocked = false;
        state.blocked_until_ms = None;
        let remaining_secs = ((state.window_end_ms() - now) / 1000).max(1) as u64;
        self.write_state(key, &state, remaining_secs).await
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        timeout(WRITE_TIMEOUT, conn.del::<_, ()>(key))
            .await
            .map_err(|_| timed_out("redis delete"))?
            .map_err(|e| unavailable("failed to delete key", e))?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<BucketState>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = timeout(READ_TIMEOUT, conn.get(key))
            .await
            .map_err(|_| timed_out("redis read"))?
            .map_err(|e| unavailable("failed to read key", e))?;

        match raw {
            Some(raw) => Ok(Some(Self::decode(key, &raw)?)),
            None => Ok(None),
        }
    }

    async fn increment(&self, key: &str, limit: u64, window: Duration) -> Result<(u64, i64)> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(INCREMENT_SCRIPT);
        let (count, window_start_ms): (u64, i64) = timeout(
            WRITE_TIMEOUT,
            script
                .key(key)
                .arg(limit)
                .arg(window.as_secs())
                .arg(now_unix_ms())
                .invoke_async(&mut *conn),
        )
        .await
        .map_err(|_| timed_out("redis increment"))?
        .map_err(|e| unavailable("failed to increment key", e))?;

        Ok((count, window_start_ms))
    }

    async fn is_blocked(&self, key: &str) -> Result<(bool, Option<i64>)> {
        let state = match self.get(key).await? {
            Some(state) => state,
            None => return Ok((false, None)),
        };

        if !state.blocked {
            return Ok((false, None));
        }

        // A blocked bucket with no expiry holds until its window ends.
        let until = state.blocked_until_ms.unwrap_or_else(|| state.window_end_ms());
        let now = now_unix_ms();
        if now < until {
            return Ok((true, Some(until)));
        }

        self.clear_block(key, state).await?;
        Ok((false, None))
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let now = now_unix_ms();
        let blocked_until = now + duration.as_millis() as i64;

        let mut state = match self.get(key).await? {
            Some(state) => state,
            None => BucketState::fresh(key, 0, Duration::ZERO),
        };
        state.blocked = true;
        state.blocked_until_ms = Some(blocked_until);

        // The marker must persist at least until it expires.
        let ttl_secs = duration.as_secs() + BLOCK_TTL_SLACK_SECS;
        self.write_state(key, &state, ttl_secs).await?;

        debug!(key = %key, blocked_until_ms = blocked_until, "Block installed");
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.reset_key(key).await
    }

    async fn health(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        timeout(
            READ_TIMEOUT,
            redis::cmd("PING").query_async::<_, String>(&mut *conn),
        )
        .await
        .map_err(|_| timed_out("redis ping"))?
        .map_err(|e| unavailable("redis health check failed", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close();
            info!("Redis connection pool closed");
        }
        Ok(())
    }
}
