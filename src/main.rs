use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};

use gatekeeper::config::AppConfig;
use gatekeeper::http::{AppState, HttpServer};
use gatekeeper::ratelimit::RateLimiter;
use gatekeeper::storage::{self, CounterStore, MemoryStore, StoreBackend};

/// Gatekeeper - rate limiting middleware service for HTTP APIs
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP listen address
    #[arg(short = 'a', long = "addr")]
    addr: Option<String>,

    /// Path to the credential table file
    #[arg(short = 'c', long = "credentials")]
    credentials: Option<String>,

    /// Counter store backend (shared or local)
    #[arg(long = "store")]
    store: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Gatekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration with CLI overrides
    let mut config = AppConfig::from_env()?;
    if let Some(addr) = args.addr {
        config.listen_addr = addr.parse()?;
    }
    if let Some(store) = args.store {
        config.store.backend = store.parse::<StoreBackend>()?;
    }
    if args.credentials.is_some() {
        config.credentials_file = args.credentials;
    }

    // Load the credential table; a missing file is not fatal.
    if let Some(ref path) = config.credentials_file {
        if let Err(e) = config.limits.load_credentials(path) {
            warn!(
                path = %path,
                error = %e,
                "Failed to load credential table, using default limits only"
            );
        }
    } else {
        info!("No credential table configured, using default limits only");
    }

    info!(
        addr = %config.listen_addr,
        store = ?config.store.backend,
        default_address_limit = config.limits.default_address_limit,
        default_credential_limit = config.limits.default_credential_limit,
        window_secs = config.limits.window_secs,
        block_secs = config.limits.block_secs,
        "Configuration loaded"
    );

    // Construct the counter store. Construction-time configuration errors
    // abort; a connection failure to the shared store falls back to the
    // local store so the service keeps limiting on a single replica.
    config.store.validate()?;
    let store: Arc<dyn CounterStore> = match storage::create_store(&config.store).await {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, "Shared store unavailable, falling back to local store");
            Arc::new(MemoryStore::new())
        }
    };

    let limiter = Arc::new(RateLimiter::new(store.clone(), config.limits.clone()));
    let state = AppState::new(limiter, store.clone());

    let server = HttpServer::new(config.listen_addr, state);
    info!("Starting HTTP server on {}", config.listen_addr);
    server.serve_with_shutdown(shutdown_signal()).await?;

    store.close().await?;
    info!("Gatekeeper Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
