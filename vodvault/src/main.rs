//! vodvault - HLS/MP4 archival download worker.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vodvault::config::WorkerConfig;
use vodvault::database;
use vodvault::database::jobs::JobStore;
use vodvault::logging::init_logging;
use vodvault::queue::JobQueue;
use vodvault::runner::JobRunner;
use vodvault::worker::Worker;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Store readiness wait: attempts x delay.
const STARTUP_ATTEMPTS: u32 = 30;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();
    let _guard = init_logging(&config.log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    info!("Starting vodvault worker v{}", env!("CARGO_PKG_VERSION"));

    // The muxer is a hard dependency; refuse to start without it.
    let muxer = Arc::new(
        fetchio_engine::Muxer::new().map_err(|e| anyhow::anyhow!("Muxer unavailable: {e}"))?,
    );

    let pool = wait_for_store(&config.database_url).await?;
    info!("Running database migrations");
    database::run_migrations(&pool).await?;

    let store = JobStore::new(pool.clone());
    let queue = JobQueue::new(pool);
    match queue.depth().await {
        Ok(depth) if depth > 0 => info!(depth, "Jobs already queued"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Could not read queue depth"),
    }

    let shutdown = CancellationToken::new();
    let runner = JobRunner::new(store, queue.clone(), muxer, config);
    let worker = Worker::new(queue, runner, shutdown.clone());

    let worker_handle = tokio::spawn(async move { worker.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, finishing current job before shutdown");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, finishing current job before shutdown");
        }
    }
    shutdown.cancel();

    if let Err(e) = worker_handle.await {
        warn!(error = %e, "Worker task ended abnormally");
    }

    info!("vodvault shutdown complete");
    Ok(())
}

/// Wait for the job store to become reachable.
async fn wait_for_store(database_url: &str) -> anyhow::Result<database::DbPool> {
    for attempt in 1..=STARTUP_ATTEMPTS {
        match database::init_pool(database_url).await {
            Ok(pool) => match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => {
                    info!("Database connection established");
                    return Ok(pool);
                }
                Err(e) => warn!(attempt, error = %e, "Database not ready"),
            },
            Err(e) => warn!(attempt, error = %e, "Waiting for database"),
        }
        if attempt < STARTUP_ATTEMPTS {
            tokio::time::sleep(STARTUP_RETRY_DELAY).await;
        }
    }
    anyhow::bail!("Failed to connect to database after {STARTUP_ATTEMPTS} attempts")
}

/// Wait for SIGTERM (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

/// On non-Unix targets SIGTERM does not exist; ctrl_c above covers shutdown.
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
