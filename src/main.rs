use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotagate::config::{QuotagateConfig, StoreBackend};
use quotagate::http::HttpServer;
use quotagate::ratelimit::{CounterStore, Limiters, MemoryStore, RedisStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Distributed fixed-window rate limiting in front of the agent API.
#[derive(Parser, Debug)]
#[command(name = "quotagate", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Redis URL, overriding the configuration and REDIS_URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Counter store backend, overriding the configuration
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Quotagate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = QuotagateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(url) = args.redis_url {
        config.store.url = url;
    }
    if let Some(backend) = args.store {
        config.store.backend = backend;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    // One store handle, shared by every limiter
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => RedisStore::start(&config.store)?,
        StoreBackend::Memory => {
            warn!("Using in-process counter store; limits are not shared between instances");
            let store = Arc::new(MemoryStore::new());
            spawn_purge(store.clone());
            store
        }
    };

    let limiters = Limiters::new(&config.limits, store);
    info!("Rate limiters initialized");

    let server = HttpServer::new(config.server.listen_addr, limiters.clone());
    server.serve_with_shutdown(shutdown_signal()).await?;

    limiters.shutdown().await?;
    info!("Quotagate stopped");
    Ok(())
}

/// Periodically drop expired entries that are never read again.
fn spawn_purge(store: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
