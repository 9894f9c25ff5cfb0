use anyhow::{Context, Result};
use clap::Parser;
use docquery::{
    config, embedding,
    index::VectorIndex,
    logging,
    metrics::CodeMetrics,
    processing::IngestionPipeline,
    qdrant::QdrantService,
    queue::PgJobQueue,
    storage,
    store::PgStore,
    worker::IngestionWorker,
};
use std::{sync::Arc, time::Duration};

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(
    name = "docquery-worker",
    about = "Consume PDF ingestion jobs and index their chunks"
)]
struct Cli {
    /// Maximum jobs processed at once (defaults to `WORKER_CONCURRENCY`).
    #[arg(long)]
    concurrency: Option<usize>,
    /// Process every job that is ready now, then exit.
    #[arg(long)]
    drain: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_config().context("Failed to load configuration")?;
    logging::init_tracing("worker");
    let config = config::get_config();

    let store = PgStore::connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    store.migrate().await.context("Failed to apply migrations")?;
    let queue = PgJobQueue::new(
        store.pool().clone(),
        config.worker.max_attempts,
        config.worker.lease,
    );

    let index = QdrantService::new(
        &config.qdrant_url,
        config.qdrant_api_key.clone(),
        config.qdrant_collection_name.clone(),
        config.embedding.dimension,
    )
    .context("Failed to build Qdrant client")?;
    index.ensure_ready().await.context("Failed to prepare Qdrant collection")?;

    let metrics = Arc::new(CodeMetrics::new());
    let pipeline = IngestionPipeline::new(
        storage::from_settings(&config.storage).context("Failed to build blob store")?,
        embedding::from_settings(&config.embedding).context("Failed to build embedding client")?,
        Arc::new(index),
        metrics.clone(),
        config.chunk_size,
        config.chunk_overlap,
    );
    let worker = IngestionWorker::new(
        Arc::new(queue),
        Arc::new(pipeline),
        cli.concurrency.unwrap_or(config.worker.concurrency),
        config.worker.poll_interval,
    );

    if cli.drain {
        let report = worker.run_until_idle().await;
        tracing::info!(
            completed = report.completed,
            retrying = report.retrying,
            dead = report.dead,
            "Drain finished"
        );
        metrics.log_ingestion("drain");
        return Ok(());
    }

    let reporter = tokio::spawn({
        let metrics = metrics.clone();
        async move {
            let mut ticks = tokio::time::interval(METRICS_LOG_INTERVAL);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                metrics.log_ingestion("interval");
            }
        }
    });

    worker
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;
    reporter.abort();
    metrics.log_ingestion("shutdown");
    Ok(())
}
