//! Tally engine daemon
//!
//! Wires the cache tier, the durable store, and the service layer together,
//! runs the sync and event queue workers, and drains them on shutdown. The
//! assembled `TrackService` is the embedding surface; this binary keeps the
//! background machinery alive.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tally_cache::{BatchDeductManager, RedisCache, RegionalCaches};
use tally_core::traits::FeatureCatalog;
use tally_core::EngineConfig;
use tally_db::{create_pool, run_migrations, PgFeatureCatalog};
use tally_services::{
    DeductionRunner, EventQueue, LoggingNotificationHook, SyncQueue, SyncReconciler, TrackService,
};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tally_engine={},tally_services={},tally_cache={},tally_db={},sqlx=warn",
            log_level, log_level, log_level, log_level
        ))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting tally engine v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load()?;

    info!("Connecting to database...");
    let pool = create_pool(&config.database).await?;
    run_migrations(&pool).await?;

    info!("Connecting to cache regions...");
    let mut regions = HashMap::new();
    for region in &config.cache.regions {
        let cache = RedisCache::new(&region.url).await?;
        cache.ping().await?;
        info!(region = %region.name, "Cache region connected");
        regions.insert(region.name.clone(), cache);
    }
    let caches = Arc::new(RegionalCaches::new(
        regions,
        config.cache.home_region.clone(),
    )?);

    let catalog: Arc<dyn FeatureCatalog> = Arc::new(PgFeatureCatalog::new(pool.clone()));
    let runner = Arc::new(DeductionRunner::new(
        pool.clone(),
        Arc::clone(&caches),
        Arc::clone(&catalog),
        Some(Arc::new(LoggingNotificationHook)),
        config.deduction.clone(),
    ));
    let reconciler = Arc::new(SyncReconciler::new(
        Arc::clone(&runner),
        Arc::clone(&caches),
        Arc::clone(&catalog),
    ));

    let sync_queue = SyncQueue::start(config.queues.clone(), {
        let reconciler = Arc::clone(&reconciler);
        move |items| {
            let reconciler = Arc::clone(&reconciler);
            async move {
                reconciler.sync_batch(items).await;
            }
        }
    });
    let event_queue = EventQueue::start(config.queues.clone(), {
        let pool = pool.clone();
        move |events| {
            let pool = pool.clone();
            async move {
                if let Err(e) = tally_db::event_repo::insert_batch(&pool, &events).await {
                    tracing::warn!(error = %e, "Event batch flush failed");
                }
            }
        }
    });

    let batch = BatchDeductManager::new(caches.home().clone(), config.cache.balance_ttl_secs);
    let service = TrackService::new(
        batch,
        runner,
        catalog,
        Arc::clone(&caches),
        sync_queue,
        event_queue,
    );

    info!(
        home_region = %config.cache.home_region,
        "Tally engine ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; draining queues");
    service.shutdown().await;
    info!("Tally engine stopped");

    Ok(())
}
