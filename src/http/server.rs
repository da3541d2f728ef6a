//! HTTP server assembly.

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tracing::info;

use super::{handlers, middleware, AppState};
use crate::error::Result;

/// HTTP server for the rate limited API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared application state
    state: AppState,
}

impl HttpServer {
    /// Create a new server over the given state.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Assemble the router: the demo route sits behind the gateway;
    /// health, metrics, and the admin façade are exempt.
    pub fn router(state: AppState) -> Router {
        let protected = Router::new()
            .route("/", get(handlers::demo))
            .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit));

        Router::new()
            .route("/health", get(handlers::health))
            .route("/metrics", get(handlers::metrics))
            .route("/admin/status", get(handlers::admin_status))
            .route("/admin/reset", post(handlers::admin_reset))
            .merge(protected)
            .with_state(state)
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves and returns once in-flight requests have drained.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = Self::router(self.state);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await?;

        Ok(())
    }
}
