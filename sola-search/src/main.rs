//! sola-search - frame search API
//!
//! Wires the account store, counter cache, shard client, frame tools and
//! metadata enrichment into the HTTP search endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sola_common::config::{load_config, resolve_config_path};
use sola_common::db::{init_database_pool, init_search_tables};
use sola_search::accounts::AccountStore;
use sola_search::admission::AdmissionController;
use sola_search::counters::{CounterStore, Counters, MemoryCounterStore, RedisCounterStore};
use sola_search::enrichment::{AnilistClient, MetadataEnricher};
use sola_search::fetch::ImageFetcher;
use sola_search::frame::FfmpegTools;
use sola_search::orchestrator::{OrchestratorConfig, SearchOrchestrator};
use sola_search::shard_client::{HttpShardClient, ShardClientConfig};
use sola_search::signing::MediaSigner;
use sola_search::{build_router, AppState, SearchService};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sola-search")]
#[command(about = "Frame search API with admission control")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SOLA_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "SOLA_SEARCH_BIND")]
    bind: Option<String>,

    /// Salt for media link tokens (overrides the config file)
    #[arg(long, env = "SOLA_MEDIA_SALT", hide_env_values = true)]
    media_salt: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = resolve_config_path(args.config.as_deref());
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter_directive("sola_search").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting sola-search v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => warn!("No config file found, using compiled defaults"),
    }

    let settings = config.search.clone();

    let db_path = config.database_path();
    info!("Database path: {}", db_path.display());
    let pool = init_database_pool(&db_path, Duration::from_millis(settings.store_timeout_ms))
        .await
        .context("Failed to open database")?;
    init_search_tables(&pool)
        .await
        .context("Failed to initialize search tables")?;

    let store_timeout = Duration::from_millis(settings.store_timeout_ms);
    let store: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisCounterStore::connect(url, store_timeout)
                .await
                .context("Failed to connect to Redis")?;
            info!("Search counters in Redis");
            Arc::new(store)
        }
        None => {
            warn!("No redis_url configured, search counters kept in process memory");
            Arc::new(MemoryCounterStore::new())
        }
    };
    let counters = Counters::new(store, settings.counter_ttl_secs);
    let admission = AdmissionController::new(AccountStore::new(pool), counters, settings.queue_cap);

    if settings.shards.is_empty() {
        warn!("No search shards configured; every search returns no results");
    }
    let shard_client = HttpShardClient::new(ShardClientConfig {
        shards: settings.shards.clone(),
        handler: settings.query_handler.clone(),
        accuracy: settings.accuracy,
        rows: settings.rows,
        timeout: Duration::from_millis(settings.shard_timeout_ms),
    })?;

    let enricher: Arc<dyn MetadataEnricher> = Arc::new(AnilistClient::new(
        settings.enrichment_url.clone(),
        Duration::from_millis(settings.enrichment_timeout_ms),
        settings.enrichment_per_minute,
    )?);

    let media_salt = args.media_salt.unwrap_or(settings.media_salt.clone());
    if media_salt.is_empty() {
        warn!("Media salt is empty; preview links will not validate");
    }
    let orchestrator = SearchOrchestrator::new(
        Arc::new(shard_client),
        MediaSigner::new(settings.media_url.clone(), media_salt),
        Some(enricher),
        OrchestratorConfig {
            initial_candidates: settings.initial_candidates,
            merge_window_secs: settings.merge_window_secs,
            top_k: settings.top_k,
        },
    );

    let fetcher = ImageFetcher::new(
        settings.image_proxy_url.clone(),
        settings.direct_fetch_hosts.clone(),
        Duration::from_millis(settings.fetch_timeout_ms),
        settings.max_body_bytes,
    )?;
    let tools = Arc::new(FfmpegTools::new(
        settings.ffmpeg_path.clone(),
        settings.ffprobe_path.clone(),
        Duration::from_millis(settings.ffmpeg_timeout_ms),
    ));

    let service = SearchService::new(admission, fetcher, tools.clone(), tools, orchestrator);
    let app = build_router(AppState::new(Arc::new(service)), settings.max_body_bytes);

    let bind = args.bind.unwrap_or(settings.bind_addr);
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("sola-search listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
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
