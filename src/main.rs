//! httpq webhook delivery service.
//!
//! Main entry point for the httpq server. Prepares the schema and the event
//! partitions, then runs the main and retry dequeue loops and the partition
//! manager until a shutdown signal arrives.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use httpq_core::{
    storage::{schema, Storage},
    Clock, RealClock,
};
use httpq_delivery::{
    client::DeliveryClient,
    dequeue::DequeueLoop,
    partition_manager::PartitionManager,
    pipeline::SendPipeline,
    poller::{MainQueuePoller, RetryQueuePoller},
    worker_pool::WorkerPool,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log);

    info!("Starting httpq webhook delivery service");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        worker_pool_multiplier = config.worker_pool_multiplier,
        execution_window_ms = config.execution_window_ms,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    schema::ensure_schema(&db_pool).await.context("Failed to prepare database schema")?;
    info!("Database schema ready");

    let storage = Storage::new(db_pool.clone());
    storage.health_check().await.context("Database health check failed")?;

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let cancellation = CancellationToken::new();

    let partition_manager = PartitionManager::new(
        storage.partitions.clone(),
        clock.clone(),
        config.partition_past_days,
        config.partition_future_days,
        cancellation.clone(),
    );
    partition_manager.run_once().await.context("Initial partition reconciliation failed")?;

    let client = DeliveryClient::new(config.to_client_config())?;
    let workers = WorkerPool::start(WorkerPool::size_for(config.worker_pool_multiplier), client);
    info!(workers = workers.size(), "Delivery worker pool started");

    let pipeline = Arc::new(SendPipeline::new(workers.handle()));
    let main_poller =
        MainQueuePoller::new(storage.clone(), pipeline.clone(), config.main_batch_size);
    let retry_poller = RetryQueuePoller::new(storage, pipeline, config.retry_batch_size);

    let tasks = vec![
        tokio::spawn(
            DequeueLoop::new(Arc::new(main_poller), clock.clone(), cancellation.clone())
                .with_window(config.execution_window())
                .run(),
        ),
        tokio::spawn(
            DequeueLoop::new(Arc::new(retry_poller), clock, cancellation.clone())
                .with_window(config.execution_window())
                .run(),
        ),
        tokio::spawn(partition_manager.run()),
    ];

    info!("httpq is delivering webhooks");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");
    cancellation.cancel();

    let grace = config.shutdown_timeout();
    match tokio::time::timeout(grace, join_tasks(tasks)).await {
        Ok(()) => info!("Background tasks stopped"),
        Err(_) => warn!(timeout_seconds = grace.as_secs(), "Shutdown grace period expired"),
    }

    if let Err(e) = workers.shutdown(grace).await {
        error!(error = %e, "Worker pool did not stop cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("httpq shutdown complete");
    Ok(())
}

/// Waits for every background task, logging the ones that panicked.
async fn join_tasks(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task failed");
        }
    }
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects to Postgres, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const CONNECT_ATTEMPTS: u32 = 6;
    const BACKOFF: Duration = Duration::from_secs(2);

    let options = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800));

    let mut attempt = 1;
    loop {
        match options.clone().connect(&config.database_url).await {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, max_attempts = CONNECT_ATTEMPTS, error = %e, "Postgres unavailable, retrying");
                attempt += 1;
                tokio::time::sleep(BACKOFF).await;
            },
            Err(e) => return Err(e).context("Could not connect to Postgres"),
        }
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
