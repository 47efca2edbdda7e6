mod config;
mod context;
mod credentials;
mod db;
mod errors;
mod models;
mod routes;
mod sources;
mod state;
mod sync;
mod users;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::context::snapshots::PgSnapshotStore;
use crate::credentials::m2m::{ClientCredentialsProvider, M2mTokenProvider};
use crate::credentials::store::PgCredentialStore;
use crate::credentials::CredentialResolver;
use crate::db::create_pool;
use crate::routes::build_router;
use crate::sources::registry::PgSourceRegistry;
use crate::sources::state_store::PgSyncStateStore;
use crate::state::AppState;
use crate::sync::fetcher::ContextPackFetcher;
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::queue::{RedisSyncQueue, SyncQueue};
use crate::sync::scheduler::{CrossProductScan, SyncScheduler};
use crate::sync::worker::{run_sweep_loop, run_worker};
use crate::users::PgUserDirectory;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting gateway API v{}", env!("CARGO_PKG_VERSION"));
    sync::metrics::describe();

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url, config.database_max_connections).await?;

    // Initialize Redis
    let redis = redis::Client::open(config.redis_url.clone())?;
    info!("Redis client initialized");

    // Stores
    let sources = Arc::new(PgSourceRegistry::new(db.clone()));
    let states = Arc::new(PgSyncStateStore::new(db.clone()));
    let snapshots = Arc::new(PgSnapshotStore::new(db.clone()));
    let users = Arc::new(PgUserDirectory::new(db.clone()));
    if config.credential_master_key.is_none() {
        info!("CREDENTIAL_MASTER_KEY not set; sources with stored credentials will fail");
    }
    let credentials = Arc::new(PgCredentialStore::new(
        db.clone(),
        config.credential_master_key.clone(),
    ));

    // Outbound HTTP
    let http = reqwest::Client::builder()
        .timeout(config.sync.fetch_timeout)
        .build()?;
    let m2m = config.m2m.clone().map(|m2m| {
        info!("M2M token provider enabled ({})", m2m.token_url);
        Arc::new(ClientCredentialsProvider::new(http, m2m)) as Arc<dyn M2mTokenProvider>
    });
    let resolver = CredentialResolver::new(credentials, m2m);
    let fetcher = ContextPackFetcher::new(resolver, config.sync.fetch_timeout)?;

    let orchestrator = Arc::new(SyncOrchestrator::new(
        sources.clone(),
        states.clone(),
        snapshots.clone(),
        fetcher,
        config.sync.error_backoff,
    ));

    let scan = Arc::new(CrossProductScan::new(sources.clone(), users, states));
    let sweep_queue: Arc<dyn SyncQueue> =
        Arc::new(RedisSyncQueue::connect(&redis, config.sync.pending_ttl).await?);
    let scheduler = Arc::new(SyncScheduler::new(scan, sweep_queue));

    // Background sync: one sweep loop, N workers each with their own connection
    tokio::spawn(run_sweep_loop(
        scheduler.clone(),
        config.sync.sweep_interval,
        config.sync.sweep_limit,
    ));
    for worker_id in 0..config.sync.workers {
        let queue: Arc<dyn SyncQueue> =
            Arc::new(RedisSyncQueue::connect(&redis, config.sync.pending_ttl).await?);
        tokio::spawn(run_worker(worker_id, queue, orchestrator.clone()));
    }
    info!("Started {} context sync workers", config.sync.workers);

    // Build app state
    let state = AppState {
        config: config.clone(),
        sources,
        snapshots,
        orchestrator,
        scheduler,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
