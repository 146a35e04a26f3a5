//! Dropstats - drop-rate statistics engine
//!
//! Serves drop matrix, pattern matrix and trend results aggregated from
//! verified drop reports:
//! - Daily drop matrix materialised per server by a background worker
//! - Redis-fronted result caches with single-flight recomputation
//! - Public JSON shim keyed by game ids, with `Last-Modified` support

mod cache;
mod config;
mod db;
mod error;
mod events;
mod models;
mod service;
mod web;
mod worker;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = config::Config::load()?;

    // RUST_LOG wins over logging.level; LOG_FORMAT=gcp switches to Cloud Logging JSON
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if std::env::var("LOG_FORMAT").unwrap_or_default() == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting dropstats...");

    let db = db::Database::new(&config.database).await?;
    db.assert_schema().await?;
    db.run_migrations().await?;
    info!("Database initialized");

    let backend = Arc::new(cache::RedisBackend::new(&config.redis.url)?);
    let caches = Arc::new(cache::Caches::new(backend, config.cache.ttl()));
    if let Err(e) = caches.backend.ping().await {
        warn!("Redis is not reachable yet, reads will fall back to recomputation: {}", e);
    }

    let service = Arc::new(service::StatsService::new(db, caches, config.query.clone()));

    let (refresh_tx, _) = broadcast::channel(64);
    let refresh = events::RefreshBus::new(refresh_tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = if config.worker.enabled {
        let worker = worker::Worker::new(service.clone(), config.worker.clone())?;
        Some(worker.spawn(refresh.subscribe(), shutdown_rx.clone()))
    } else {
        info!("Calculation worker disabled");
        None
    };

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let state = Arc::new(web::AppState {
        service,
        refresh,
        admin_key: config.admin.api_key.clone(),
    });
    let served = web::start_server(&config.server, state, shutdown_rx).await;

    if let Some(mut handle) = worker {
        let grace = config.worker.shutdown_grace();
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("Calculation worker still busy after {:?}, aborting", grace);
            handle.abort();
        }
    }

    info!("Dropstats stopped");
    served
}
