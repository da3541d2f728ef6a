//! Counter store backends.
//!
//! The decision engine talks to a `CounterStore` and never to a concrete
//! backend. Two implementations share the contract: a Redis-backed store
//! shared across replicas (`shared`) and an in-process store used as a
//! fallback and for tests (`local`). Per-key linearizability is the
//! backend's responsibility; the engine holds no lock across store calls.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::LimiterKind;

/// Smallest Redis logical database index accepted by the factory.
const REDIS_DB_MIN: i64 = 0;
/// Largest Redis logical database index accepted by the factory.
const REDIS_DB_MAX: i64 = 15;

/// Current instant as unix milliseconds.
///
/// All persisted timestamps use this representation so both backends and
/// the Lua increment script agree on arithmetic.
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Persisted state of one bucket, owned exclusively by the store.
///
/// Readers always receive a value snapshot; the engine and gateway never
/// mutate one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketState {
    /// Canonical storage key `rate_limit:<kind>:<identity>`
    pub key: String,
    /// Which identity kind the bucket counts
    #[serde(default)]
    pub kind: LimiterKind,
    /// Admitted plus overflowing hits in the current window
    pub count: u64,
    /// Configured limit snapshot at last window start
    pub limit: u64,
    /// Window length snapshot in seconds
    pub window_secs: u64,
    /// Unix milliseconds when the current window began
    pub window_start_ms: i64,
    /// Whether a block is currently in force
    pub blocked: bool,
    /// Unix milliseconds until which the block holds, when one is in force
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until_ms: Option<i64>,
}

impl BucketState {
    /// A zeroed bucket for a key that has no persisted state yet.
    pub fn fresh(key: &str, limit: u64, window: Duration) -> Self {
        Self {
            key: key.to_string(),
            kind: crate::ratelimit::kind_from_key(key).unwrap_or_default(),
            count: 0,
            limit,
            window_secs: window.as_secs(),
            window_start_ms: now_unix_ms(),
            blocked: false,
            blocked_until_ms: None,
        }
    }

    /// Unix milliseconds at which the current window ends.
    pub fn window_end_ms(&self) -> i64 {
        self.window_start_ms + self.window_secs as i64 * 1000
    }
}

/// Contract shared by both counter store backends.
///
/// `increment`, `block`, and `reset` on the same key are linearizable.
/// Each backend imposes its own per-operation deadline; a lapsed deadline
/// surfaces as `StoreUnavailable`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Return a snapshot of the bucket, or `None` when no state exists.
    async fn get(&self, key: &str) -> Result<Option<BucketState>>;

    /// Atomically bump the counter for `key`, reopening the window when it
    /// has elapsed. Returns `(new_count, window_start_ms)`.
    async fn increment(&self, key: &str, limit: u64, window: Duration) -> Result<(u64, i64)>;

    /// Return the current block status, lazily clearing an expired marker.
    async fn is_blocked(&self, key: &str) -> Result<(bool, Option<i64>)>;

    /// Quarantine `key` for `duration` starting now.
    async fn block(&self, key: &str, duration: Duration) -> Result<()>;

    /// Remove both counter and block state for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Reachability probe.
    async fn health(&self) -> Result<()>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Which backend the factory constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis, shared across replicas
    Shared,
    /// In-process maps, single replica
    Local,
}

impl std::str::FromStr for StoreBackend {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(StoreBackend::Shared),
            "local" => Ok(StoreBackend::Local),
            other => Err(GatekeeperError::Config(format!(
                "unsupported store backend: {}",
                other
            ))),
        }
    }
}

/// Connection parameters for the shared backend.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    /// Build the connection URL, embedding the password when one is set.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Validate host, port, and database index.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(GatekeeperError::Config("redis host cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(GatekeeperError::Config("redis port cannot be zero".into()));
        }
        if !(REDIS_DB_MIN..=REDIS_DB_MAX).contains(&self.db) {
            return Err(GatekeeperError::Config(format!(
                "redis database must be between {} and {}, got: {}",
                REDIS_DB_MIN, REDIS_DB_MAX, self.db
            )));
        }
        Ok(())
    }
}

/// Full store selection: a backend tag plus backend-specific parameters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis: Option<RedisConfig>,
}

impl StoreConfig {
    /// Validate the selection without connecting anywhere.
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            StoreBackend::Shared => match &self.redis {
                Some(redis) => redis.validate(),
                None => Err(GatekeeperError::Config(
                    "shared store selected but redis parameters are missing".into(),
                )),
            },
            StoreBackend::Local => Ok(()),
        }
    }
}

/// Construct the configured backend.
///
/// Shared-backend construction failure is reported to the caller; falling
/// back to the local backend is the caller's policy, not the factory's.
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    config.validate()?;

    match config.backend {
        StoreBackend::Shared => {
            // validate() guarantees the parameters are present
            let redis = config.redis.as_ref().ok_or_else(|| {
                GatekeeperError::Config("shared store selected but redis parameters are missing".into())
            })?;
            let store = RedisStore::connect(redis).await?;
            info!(host = %redis.host, port = redis.port, db = redis.db, "Shared counter store created");
            Ok(Arc::new(store))
        }
        StoreBackend::Local => {
            let store = MemoryStore::new();
            info!("Local counter store created");
            Ok(Arc::new(store))
        }
    }
}
