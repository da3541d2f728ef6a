//! Configuration management for Gatekeeper.
//!
//! All configuration is read from the environment once at startup and
//! frozen; nothing on the hot path consults it mutably. The credential
//! table is loaded from a YAML file named by `CREDENTIALS_FILE`.

use std::net::SocketAddr;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::RateLimitConfig;
use crate::storage::{RedisConfig, StoreBackend, StoreConfig};

/// Default HTTP listen address.
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen address
    pub listen_addr: SocketAddr,
    /// Counter store selection
    pub store: StoreConfig,
    /// Frozen limiter budgets
    pub limits: RateLimitConfig,
    /// Optional path to the credential table file
    pub credentials_file: Option<String>,
}

impl AppConfig {
    /// Load and validate the full configuration from the environment.
    ///
    /// Recognized variables: `SERVER_ADDR`, `DEFAULT_IP_LIMIT`,
    /// `DEFAULT_TOKEN_LIMIT`, `RATE_WINDOW`, `BLOCK_DURATION`,
    /// `STORE_BACKEND` (`shared`/`local`), `REDIS_HOST`, `REDIS_PORT`,
    /// `REDIS_PASSWORD`, `REDIS_DB`, `CREDENTIALS_FILE`.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("SERVER_ADDR", DEFAULT_LISTEN_ADDR)
            .parse()
            .map_err(|e| GatekeeperError::Config(format!("invalid SERVER_ADDR: {}", e)))?;

        let limits = RateLimitConfig {
            default_address_limit: env_parse("DEFAULT_IP_LIMIT", 10)?,
            default_credential_limit: env_parse("DEFAULT_TOKEN_LIMIT", 100)?,
            window_secs: env_parse("RATE_WINDOW", 60)?,
            block_secs: env_parse("BLOCK_DURATION", 180)?,
            credentials: Default::default(),
        };
        limits.validate()?;

        let backend: StoreBackend = env_or("STORE_BACKEND", "local").parse()?;
        let port = env_parse("REDIS_PORT", 6379)?;
        let redis = RedisConfig {
            host: env_or("REDIS_HOST", "localhost"),
            port: u16::try_from(port)
                .map_err(|_| GatekeeperError::Config(format!("invalid REDIS_PORT value: {}", port)))?,
            password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            db: env_parse("REDIS_DB", 0)? as i64,
        };
        let store = StoreConfig {
            backend,
            redis: Some(redis),
        };
        store.validate()?;

        let credentials_file = std::env::var("CREDENTIALS_FILE").ok().filter(|p| !p.is_empty());

        Ok(Self {
            listen_addr,
            store,
            limits,
            credentials_file,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map_err(|_| GatekeeperError::Config(format!("invalid {} value: {}", key, value))),
        _ => Ok(default),
    }
}
