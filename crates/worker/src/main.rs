use std::sync::Arc;
use std::time::Duration;

use genbatch_db::repositories::BatchRepo;
use genbatch_pipeline::postgres::{PgBatchStore, PgJobQueue};
use genbatch_pipeline::results::FsResultStore;
use genbatch_pipeline::{reclaimer, PipelineContext, WorkerPool};
use genbatch_provider::HttpImageGenerator;
use genbatch_worker::config::WorkerConfig;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genbatch_worker=debug,genbatch_pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().expect("Invalid worker configuration");
    tracing::info!(
        worker_count = config.worker_count,
        lease_secs = config.lease_duration.as_secs(),
        api_url = %config.generation_api_url,
        results_dir = %config.results_dir.display(),
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = genbatch_db::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    genbatch_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    genbatch_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // Repair counters left behind by a crash between an item transition
    // and its batch update.
    let repaired = BatchRepo::reconcile_counters(&pool)
        .await
        .expect("Failed to reconcile batch counters");
    if repaired > 0 {
        tracing::warn!(repaired, "Reconciled batch counters at startup");
    }

    // --- Engine ---
    let ctx = PipelineContext::new(
        Arc::new(PgJobQueue::new(pool.clone())),
        Arc::new(PgBatchStore::new(pool.clone())),
        Arc::new(FsResultStore::new(config.results_dir.clone(), pool.clone())),
        config.vault.clone(),
    );

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build HTTP client");
    let generator = Arc::new(HttpImageGenerator::with_client(
        client,
        config.generation_api_url.clone(),
    ));

    let cancel = CancellationToken::new();

    let reclaim_handle = tokio::spawn(reclaimer::run(
        ctx.clone(),
        config.reclaim_interval,
        cancel.child_token(),
    ));

    let workers = WorkerPool::start_with_token(
        ctx,
        generator,
        config.retry_policy(),
        config.pool_config(),
        cancel.child_token(),
    );

    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    workers.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), reclaim_handle).await;
    tracing::info!("Lease reclaimer stopped");

    pool.close().await;
    tracing::info!("Graceful shutdown complete");
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), draining workers");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, draining workers");
        }
    }
}
