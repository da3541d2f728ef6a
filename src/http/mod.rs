//! HTTP surface: the rate limiting gateway, service handlers, and server.

mod handlers;
mod middleware;
mod server;

pub use middleware::rate_limit;
pub use server::HttpServer;

use std::sync::Arc;
use std::time::Instant;

use crate::ratelimit::RateLimiter;
use crate::storage::CounterStore;

/// Shared state injected into the gateway and handlers.
#[derive(Clone)]
pub struct AppState {
    /// The decision engine
    pub limiter: Arc<RateLimiter>,
    /// Store handle, used directly only by the health/metrics façade
    pub store: Arc<dyn CounterStore>,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>, store: Arc<dyn CounterStore>) -> Self {
        Self {
            limiter,
            store,
            started_at: Instant::now(),
        }
    }
}
