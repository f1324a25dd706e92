//! Main entry point for the FeatureHub system.
//! Slim orchestrator that wires the four subsystems and serves their APIs.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use featurehub::bus::EventBus;
use featurehub::cleanup::CleanupEngine;
use featurehub::config::FeatureHubConfig;
use featurehub::http::query_api::QueryApiState;
use featurehub::http::rate_limit::IpRateLimiter;
use featurehub::http::{
    cleanup_api::CleanupApiState, cleanup_router, metadata_api::MetadataApiState, metadata_router,
    migration_api::MigrationApiState, migration_router, query_router,
};
use featurehub::metadata::{MetadataCache, MetadataService, MetadataStore};
use featurehub::migration::MigrationEngine;
use featurehub::router::{QueryRouter, StatUpdater};
use featurehub::storage::{MemoryKv, TieredStores};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match FeatureHubConfig::from_toml_file("featurehub.toml") {
        Ok(c) => c,
        Err(_) => FeatureHubConfig::default(),
    };
    config.init_logging();
    tracing::info!("Starting FeatureHub");

    // Physical tiers. The in-memory backend serves local deployments; real
    // protocol clients implement the same trait.
    let stores = TieredStores::new(
        Arc::new(MemoryKv::new("hot")),
        Arc::new(MemoryKv::new("cold")),
    );

    let store = MetadataStore::connect(
        &config.metadata_db_path,
        config.metadata.pool_size,
        config.metadata.pool_acquire_timeout_secs,
    )
    .await
    .context("Failed to open metadata store")?;
    let cache = MetadataCache::new(
        config.metadata.cache_capacity,
        Duration::from_secs(config.metadata.cache_ttl_min * 60),
    );
    let metadata = Arc::new(MetadataService::new(store, cache));

    let bus = Arc::new(EventBus::new(config.bus.partitions, config.bus.buffer_size));

    let stats = Arc::new(StatUpdater::new(
        Arc::clone(&metadata),
        config.router.stat_queue_capacity,
    ));
    let _stat_worker = stats.spawn_worker();

    let router = Arc::new(QueryRouter::new(
        Arc::clone(&metadata),
        stores.clone(),
        Arc::clone(&bus),
        Arc::clone(&stats),
        config.router.clone(),
    ));

    let migration = Arc::new(MigrationEngine::new(
        Arc::clone(&metadata),
        stores.clone(),
        Arc::clone(&bus),
        config.migration.clone(),
    ));
    let _migration_loops = Arc::clone(&migration).start();

    let cleanup = Arc::new(CleanupEngine::new(
        Arc::clone(&metadata),
        stores.clone(),
        Arc::clone(&bus),
        config.cleanup.clone(),
    ));
    let _cleanup_loops = Arc::clone(&cleanup).start();

    let query_state = Arc::new(QueryApiState {
        router,
        limiter: IpRateLimiter::new(config.router.rate_limit_per_minute),
    });
    let limiter_state = Arc::clone(&query_state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            limiter_state.limiter.cleanup_stale();
        }
    });
    let query_app = query_router(query_state);
    let metadata_app = metadata_router(Arc::new(MetadataApiState {
        metadata: Arc::clone(&metadata),
    }));
    let migration_app = migration_router(Arc::new(MigrationApiState { engine: migration }));
    let cleanup_app = cleanup_router(Arc::new(CleanupApiState { engine: cleanup }));

    let query_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.router.port))
        .await
        .context("Failed to bind router port")?;
    let metadata_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.metadata.port))
        .await
        .context("Failed to bind metadata port")?;
    let migration_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.migration.port))
        .await
        .context("Failed to bind migration port")?;
    let cleanup_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.cleanup.port))
        .await
        .context("Failed to bind cleanup port")?;

    tracing::info!(
        "Serving APIs: router :{}, metadata :{}, migration :{}, cleanup :{}",
        config.router.port,
        config.metadata.port,
        config.migration.port,
        config.cleanup.port
    );

    tokio::select! {
        result = axum::serve(query_listener, query_app) => {
            result.context("router API server failed")?;
        }
        result = axum::serve(metadata_listener, metadata_app) => {
            result.context("metadata API server failed")?;
        }
        result = axum::serve(migration_listener, migration_app) => {
            result.context("migration API server failed")?;
        }
        result = axum::serve(cleanup_listener, cleanup_app) => {
            result.context("cleanup API server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down gracefully");
        }
    }

    Ok(())
}
