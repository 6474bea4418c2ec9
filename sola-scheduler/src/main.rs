//! sola-scheduler - ingest job dispatcher
//!
//! Serves the worker WebSocket endpoint and runs periodic scheduling passes
//! over the file queue.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sola_common::config::{load_config, resolve_config_path};
use sola_common::db::init_database_pool;
use sola_scheduler::queue::JobQueue;
use sola_scheduler::shard_selector::{HttpShardProbe, ShardProbe};
use sola_scheduler::{build_router, AppState, Scheduler};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "sola-scheduler")]
#[command(about = "Dispatches hash and load jobs to ingest workers")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SOLA_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "SOLA_SCHEDULER_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = resolve_config_path(args.config.as_deref());
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter_directive("sola_scheduler").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting sola-scheduler v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => warn!("No config file found, using compiled defaults"),
    }

    let settings = config.scheduler.clone();

    let db_path = config.database_path();
    info!("Database path: {}", db_path.display());
    let pool = init_database_pool(&db_path, STORE_TIMEOUT)
        .await
        .context("Failed to open database")?;
    let queue = JobQueue::open(pool, &settings.algorithm)
        .await
        .context("Failed to initialize job queue")?;

    let probe: Option<Arc<dyn ShardProbe>> = if settings.solr_servers.is_empty() {
        warn!("No search servers configured; load jobs use round-robin only");
        None
    } else {
        Some(Arc::new(HttpShardProbe::new(
            settings.solr_servers.clone(),
            settings.admin_status_path.clone(),
            Duration::from_millis(settings.probe_timeout_ms),
        )?))
    };
    if settings.shards.is_empty() {
        warn!("No load targets configured");
    }

    let scheduler = Arc::new(Scheduler::new(
        queue,
        settings.algorithm.clone(),
        settings.shards.clone(),
        probe,
    ));

    if settings.pass_interval_ms > 0 {
        let scheduler = Arc::clone(&scheduler);
        let period = Duration::from_millis(settings.pass_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                scheduler.schedule().await;
            }
        });
        info!("Periodic scheduling pass every {:?}", period);
    }

    let app = build_router(AppState::new(scheduler));

    let bind = args.bind.unwrap_or(settings.bind_addr);
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("sola-scheduler listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
