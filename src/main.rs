//! Heimdall - federated debrid availability cache
//!
//! Answers "is this torrent already cached on store X?" with:
//! - A local availability cache with staleness windows and negative caching
//! - A single upstream tier per request (buddy aggregator, or a peer behind
//!   a circuit breaker)
//! - Background write-back of upstream answers and tracked observations
//! - Torrent metadata pulls and pushes across federated instances
//! - Prometheus metrics and disk persistence for the in-memory store

mod cache;
mod cascade;
mod catalog;
mod config;
mod error;
mod http;
mod magnet;
mod metrics;
mod storage;
mod torrents;
mod upstream;

use crate::cache::{load_from_disk, persist_to_disk, LocalAvailabilityCache, MemoryAvailabilityStore};
use crate::cascade::{
    AvailabilityCascade, BackgroundTasks, CircuitBreaker, UpstreamTier, WriteBackTracker,
};
use crate::config::Config;
use crate::http::AppState;
use crate::metrics::{create_metrics, SharedMetrics};
use crate::storage::{MongoStorage, Stores};
use crate::torrents::{SyncInfo, TorrentPullCascade, TorrentPusher};
use crate::upstream::{BuddyApi, BuddyClient, PeerApi, PeerClient};
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const BACKGROUND_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Heimdall - federated debrid availability cache
#[derive(Parser, Debug)]
#[command(name = "heimdall")]
#[command(author, version, about = "Federated debrid availability cache", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    /// Enable debug logging for upstream requests
    #[arg(long)]
    debug_requests: bool,

    /// Server port (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started_at = Instant::now();

    // Load .env file first (before parsing args, so env vars are available)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs, args.debug_requests)?;

    info!("Starting Heimdall v{}", env!("CARGO_PKG_VERSION"));

    // Load config (CLI port overrides env var)
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.debug_requests = args.debug_requests;

    if args.debug_requests {
        info!("Request debugging enabled");
    }

    let metrics = create_metrics();
    let tasks = BackgroundTasks::default();

    let stores = init_stores(&config, &metrics).await?;
    info!(
        backend = stores.backend(),
        instance_id = %config.upstream.instance_id,
        "Storage initialized"
    );

    let local = LocalAvailabilityCache::new(stores.availability.clone(), config.to_freshness_policy());

    // Upstream clients
    let buddy: Option<Arc<dyn BuddyApi>> = match &config.upstream.buddy_url {
        Some(url) => Some(Arc::new(BuddyClient::new(url)?)),
        None => None,
    };
    let peer: Option<Arc<dyn PeerApi>> = match &config.upstream.peer_url {
        Some(url) => Some(Arc::new(PeerClient::new(
            url,
            config.upstream.peer_auth_token.clone(),
        )?)),
        None => None,
    };
    let breaker = peer
        .as_ref()
        .map(|_| Arc::new(CircuitBreaker::new("peer", config.to_breaker_config())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    if config.upstream.has_buddy() && config.upstream.has_peer() {
        info!("Buddy configured, peer is only used for reporting and torrent sync");
    }

    // Exactly one tier answers cache misses
    let tier = UpstreamTier::select(
        buddy.clone(),
        peer.clone().zip(breaker.clone()),
        config.upstream.lazy_peer,
        &local,
        &metrics,
    );
    if let UpstreamTier::LazyPeer(puller) = &tier {
        let worker = puller.clone();
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    let cascade = Arc::new(AvailabilityCascade::new(
        local.clone(),
        tier,
        tasks.clone(),
        metrics.clone(),
    ));

    // Peer write paths need the auth token
    let report_peer = if config.upstream.can_report_to_peer() {
        peer.clone()
    } else {
        None
    };
    let tracker = Arc::new(WriteBackTracker::new(
        local.clone(),
        buddy.clone(),
        report_peer.clone(),
        tasks.clone(),
        metrics.clone(),
    ));

    // Torrent metadata federation
    let sync_info = Arc::new(SyncInfo::new(stores.sync_info.clone()));
    let (pull_peer_url, pull_local_only) = config.upstream.pull_peer();
    let pull_peer: Option<Arc<dyn PeerApi>> = match pull_peer_url {
        Some(url) if Some(&url) == config.upstream.peer_url.as_ref() => peer.clone(),
        Some(url) => Some(Arc::new(PeerClient::new(&url, None)?)),
        None => None,
    };
    let torrents = Arc::new(TorrentPullCascade::new(
        pull_peer,
        pull_local_only,
        stores.torrents.clone(),
        sync_info.clone(),
        config.upstream.instance_id.clone(),
        tasks.clone(),
        metrics.clone(),
    ));

    let (push_debounce, push_interval) = config.upstream.push_timing();
    let pusher = report_peer.map(|peer| {
        Arc::new(
            TorrentPusher::new(peer, stores.torrents.clone(), sync_info.clone(), metrics.clone())
                .with_timing(push_debounce, push_interval),
        )
    });
    if let Some(pusher) = &pusher {
        let worker = pusher.clone();
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    // Periodic snapshot of the in-memory store
    if let Some(memory) = &stores.memory {
        let memory = memory.clone();
        let path = config.cache.cache_path.clone();
        let interval = Duration::from_secs(config.cache.persist_interval_secs.max(1));
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            run_persist_loop(memory, path, interval, rx).await
        }));
    }

    let state = AppState {
        cascade,
        tracker,
        torrents,
        torrent_store: stores.torrents.clone(),
        pusher,
        breaker,
        memory: stores.memory.clone(),
        tasks: tasks.clone(),
        metrics: metrics.clone(),
        server: Arc::new(config.server.clone()),
        started_at,
    };

    let app = http::router(state);

    // Start Server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(
        "Listening on http://{} (Check: /v0/store/magnets/check, Torrents: /v0/torrents, Metrics: /metrics, Health: /health)",
        addr
    );

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
        info!("Shutdown signal received, initiating graceful shutdown...");
        let _ = shutdown_tx.send(true);
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Workers observe the shutdown channel; give them a moment to finish
    for worker in workers {
        if tokio::time::timeout(Duration::from_secs(2), worker).await.is_err() {
            warn!("Background worker did not stop in time");
        }
    }

    tasks.shutdown(BACKGROUND_SHUTDOWN_TIMEOUT).await;

    if let Some(memory) = &stores.memory {
        match persist_to_disk(memory.all_records(), &config.cache.cache_path).await {
            Ok(()) => info!("Availability cache persisted to disk on shutdown"),
            Err(e) => error!("Failed to persist availability cache on shutdown: {}", e),
        }
    }

    info!("Heimdall shutdown complete");
    Ok(())
}

/// Mongo when configured, otherwise memory seeded from the disk snapshot.
async fn init_stores(config: &Config, metrics: &SharedMetrics) -> anyhow::Result<Stores> {
    if config.storage.mongo_url.is_some() {
        info!("Mongo URL configured, connecting to MongoDB");
        let storage = MongoStorage::connect(&config.storage).await?;
        metrics.boot_type.with_label_values(&["mongo"]).inc();
        return Ok(Stores::mongo(storage));
    }

    let path = &config.cache.cache_path;
    let memory = if path.exists() {
        match load_from_disk(path).await {
            Ok(records) => {
                info!(records = records.len(), "Warm start from disk cache");
                metrics.boot_type.with_label_values(&["warm"]).inc();
                MemoryAvailabilityStore::from_records(records)
            }
            Err(e) => {
                warn!(error = %e, "Failed to load disk cache, starting empty");
                metrics.boot_type.with_label_values(&["cold"]).inc();
                MemoryAvailabilityStore::new()
            }
        }
    } else {
        info!("No disk cache found, starting empty");
        metrics.boot_type.with_label_values(&["cold"]).inc();
        MemoryAvailabilityStore::new()
    };

    metrics.local_records_total.set(memory.len() as f64);
    Ok(Stores::in_memory(Arc::new(memory)))
}

async fn run_persist_loop(
    memory: Arc<MemoryAvailabilityStore>,
    path: std::path::PathBuf,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                persist_snapshot(&memory, &path).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn persist_snapshot(memory: &MemoryAvailabilityStore, path: &Path) {
    if memory.is_empty() {
        return;
    }
    if let Err(e) = persist_to_disk(memory.all_records(), path).await {
        error!(error = %e, "Failed to persist availability cache");
    }
}

fn init_logging(level: &str, json: bool, debug_requests: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    // Build filter: set heimdall to requested level, and optionally enable request debugging
    let filter = if debug_requests {
        EnvFilter::new(format!(
            "heimdall={},heimdall::upstream=debug,tower_http=debug,hyper=warn",
            level
        ))
    } else {
        EnvFilter::new(format!("heimdall={},tower_http=info,hyper=warn", level))
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    Ok(())
}
