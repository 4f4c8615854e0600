use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::GateConfig;
use tollgate::http::HttpServer;
use tollgate::ratelimit::{DecisionEngine, PolicyTable};
use tollgate::store::{CounterStore, RedisCounterStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Per-identity admission control backed by Redis.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Configuration file, layered under environment variables
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("Starting Tollgate Admission Control Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        GateConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        redis = %config.store.address(),
        failure_policy = ?config.server.failure_policy,
        "Configuration loaded"
    );

    // The service does not start without its counter store.
    let store = Arc::new(RedisCounterStore::new(config.store.clone()));
    store
        .connect()
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.store.address()))?;
    info!(redis = %config.store.address(), "Counter store connected");

    let policy = Arc::new(PolicyTable::new(&config.policy));
    let engine = if config.server.cleanup_enabled {
        Arc::new(DecisionEngine::with_cleanup(Arc::clone(&store), policy))
    } else {
        Arc::new(DecisionEngine::new(Arc::clone(&store), policy))
    };
    info!(cleanup = config.server.cleanup_enabled, "Decision engine initialized");

    let server = HttpServer::new(
        config.server.listen_addr,
        Arc::clone(&engine),
        config.server.failure_policy,
    );
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    engine.shutdown();
    if let Err(e) = store.disconnect().await {
        warn!(error = %e, "Failed to disconnect counter store");
    }

    served?;
    info!("Tollgate Admission Control Service stopped");
    Ok(())
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
