//! Background worker entry point.
//!
//! Runs the reindex worker loop against PostgreSQL-backed stores. The HTTP
//! server is a separate process; this binary only leases and drives jobs.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use flint::{
    config::Config,
    db::{PostgresJobStore, PostgresResourceStore},
    logging,
    reindex::{AdaptiveThrottle, ReindexContext, ReindexWorker, ReindexWorkerConfig},
    search::{JsonIndexer, SearchParamInfo, SearchParamRegistry},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting flint reindex worker"
    );

    // Retry on DB connectivity errors so the worker doesn't exit on transient
    // startup issues.
    let pool = create_db_pool_with_retry(&config).await?;

    let registry = Arc::new(SearchParamRegistry::new());
    if let Some(path) = &config.reindex.parameters_file {
        let count = seed_registry(&registry, path)
            .with_context(|| format!("Failed to load search parameters from {path}"))?;
        tracing::info!(count, path, "Seeded search-parameter registry");
    }

    let store = Arc::new(PostgresResourceStore::new(pool.clone()));
    let jobs = Arc::new(PostgresJobStore::new(pool.clone()));
    let ctx = ReindexContext {
        store,
        jobs,
        resolver: registry,
        indexer: Arc::new(JsonIndexer::new()),
        throttle: Arc::new(AdaptiveThrottle::new(config.reindex.batch_size)),
    };

    let worker_config = ReindexWorkerConfig::from(&config.reindex);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = ReindexWorker::new(ctx, worker_config, shutdown_rx);

    let handle = tokio::spawn(worker.run());
    tracing::info!("Worker running. Press Ctrl+C to stop.");

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Worker ended with error: {}", e),
        Err(e) => tracing::error!("Worker task join error: {}", e),
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}

async fn create_db_pool_with_retry(config: &Config) -> anyhow::Result<PgPool> {
    let mut retry_delay = Duration::from_secs(1);
    let max_delay = Duration::from_secs(30);

    loop {
        match create_db_pool(config).await {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                tracing::error!(
                    "Failed to connect to database: {} (retrying in {:?})",
                    e,
                    retry_delay
                );
                sleep(jittered_duration(retry_delay, 0.2)).await;
                retry_delay = (retry_delay * 2).min(max_delay);
            }
        }
    }
}

async fn create_db_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    let statement_timeout = config.database.statement_timeout_seconds;
    let lock_timeout = config.database.lock_timeout_seconds;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .min_connections(config.database.pool_min_size)
        .max_connections(config.database.pool_max_size)
        .acquire_timeout(Duration::from_secs(config.database.pool_timeout_seconds))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = '{}s'", statement_timeout))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!("SET lock_timeout = '{}s'", lock_timeout))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.database.url)
        .await?;

    tracing::info!(
        min = config.database.pool_min_size,
        max = config.database.pool_max_size,
        "Database pool created"
    );
    Ok(pool)
}

fn seed_registry(registry: &SearchParamRegistry, path: &str) -> anyhow::Result<usize> {
    let raw = std::fs::read(path)?;
    let params: Vec<SearchParamInfo> = serde_json::from_slice(&raw)?;
    let count = params.len();
    for param in params {
        registry.register(param);
    }
    Ok(count)
}

fn jittered_duration(base: Duration, jitter_ratio: f64) -> Duration {
    if base.is_zero() || jitter_ratio <= 0.0 {
        return base;
    }

    let bytes = *Uuid::new_v4().as_bytes();
    let value = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
    let unit = (value as f64) / (u64::MAX as f64); // [0,1]
    let signed = unit * 2.0 - 1.0; // [-1,1]
    let factor = (1.0 + signed * jitter_ratio).max(0.0);
    base.mul_f64(factor)
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
/// Docker sends SIGTERM, while Ctrl+C sends SIGINT.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
    let sigint = tokio::signal::ctrl_c();

    tokio::select! {
        _ = sigint => {
            tracing::info!("SIGINT received, stopping worker...");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, stopping worker...");
        }
    }
}

/// Wait for shutdown signal (SIGINT only on non-Unix platforms).
#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, stopping worker...");
}
