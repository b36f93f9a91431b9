//! Job Worker Service
//!
//! Consumes one job pipeline from NATS JetStream and executes its jobs on a
//! local worker pool.
//!
//! ```text
//! JetStream ──▶ NatsConsumer ──▶ PriorityQueue ──▶ WorkerPool ──▶ JobHandler
//!                    ▲                                  │
//!                    └──────── ack / nak ◀──────────────┘
//! ```
//!
//! ## Configuration
//!
//! - `NATS_URL`: broker address (required)
//! - `PIPELINE_NAME`, `PIPELINE_DRIVER`: pipeline descriptor (`default`, `nats`)
//! - `NATS_SUBJECT`, `NATS_STREAM`, `NATS_PREFETCH`, `NATS_RATE_LIMIT`,
//!   `NATS_DELIVER_NEW`, `NATS_DELETE_AFTER_ACK`, `NATS_DELETE_STREAM_ON_STOP`
//! - `WORKER_COUNT`: concurrent workers (default 4)
//! - `HEALTH_PORT`: health server port (default 8081)
//! - `APP_ENV`: `production` switches logs to JSON

pub mod config;
pub mod health;
pub mod manager;
pub mod worker;

pub use config::{Config, Environment};
pub use health::HealthServer;
pub use manager::{Driver, PipelineManager};
pub use worker::{JobHandler, LogHandler, Outcome, WorkerPool};

use eyre::{Result, WrapErr};
use jobs::PriorityQueue;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Run the job worker service.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    init_tracing(environment);

    let config = Config::from_env().wrap_err("Failed to load configuration")?;

    info!(
        pipeline = %config.pipeline.name(),
        driver = %config.pipeline.driver(),
        workers = config.worker_count,
        "Starting job worker"
    );

    let metrics_handle = nats_jobs::init_metrics().cloned();

    let queue = Arc::new(PriorityQueue::new());
    let source = manager::connect(&config.pipeline, &config.nats, queue.clone())
        .await
        .wrap_err("Failed to connect job source")?;
    let manager = PipelineManager::start(source, config.pipeline.clone())
        .await
        .wrap_err("Failed to start pipeline")?;

    let mut health = HealthServer::new(config.health_port, manager.source());
    if let Some(handle) = metrics_handle {
        health = health.with_metrics(handle);
    }
    tokio::spawn(async move {
        if let Err(e) = health.run().await {
            error!(error = %e, "Health server error");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers =
        WorkerPool::new(queue, Arc::new(LogHandler), config.worker_count).spawn(shutdown_rx);

    shutdown_signal().await?;

    // Workers finish their current item while the broker is still reachable.
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Worker task failed");
        }
    }

    manager
        .shutdown()
        .await
        .wrap_err("Failed to stop pipeline")?;

    info!("Job worker shut down gracefully");
    Ok(())
}

fn init_tracing(environment: Environment) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if environment.is_production() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
