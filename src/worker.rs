//! Long-running consumer that drives the ingestion pipeline from the job queue.

use crate::{
    processing::IngestionPipeline,
    queue::{ClaimedJob, FailureDisposition, JobQueue},
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::{Instant, sleep},
};

/// Result of one job attempt as reported to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Pipeline finished; the job is complete.
    Completed,
    /// Attempt failed and the queue scheduled a retry.
    Retrying,
    /// Attempt failed and the job has no attempts left.
    Dead,
}

/// Totals returned by [`IngestionWorker::run_until_idle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs completed.
    pub completed: usize,
    /// Failed attempts that will be retried.
    pub retrying: usize,
    /// Jobs that exhausted their attempts.
    pub dead: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying => self.retrying += 1,
            JobOutcome::Dead => self.dead += 1,
        }
    }
}

/// Polls the queue and runs up to `concurrency` jobs at a time.
pub struct IngestionWorker {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<IngestionPipeline>,
    concurrency: usize,
    poll_interval: Duration,
}

impl IngestionWorker {
    /// Create a worker.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<IngestionPipeline>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            pipeline,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Consume jobs until `shutdown` resolves, then wait for in-flight jobs.
    ///
    /// Sleeps for the poll interval only when the queue is empty.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Ingestion worker started"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Ingestion worker received shutdown signal");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(result) = tasks.try_join_next() {
                log_join_result(result);
            }

            match self.queue.claim().await {
                Ok(Some(claimed)) => {
                    let runner = self.runner();
                    tasks.spawn(runner.execute(claimed, Some(permit)));
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => {
                            tracing::info!("Ingestion worker received shutdown signal");
                            break;
                        }
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    tracing::error!(error = %err, "Failed to claim job");
                    tokio::select! {
                        _ = &mut shutdown => {
                            tracing::info!("Ingestion worker received shutdown signal");
                            break;
                        }
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for in-flight jobs");
        }
        while let Some(result) = tasks.join_next().await {
            log_join_result(result);
        }
        tracing::info!("Ingestion worker stopped");
    }

    /// Process every job that is claimable now, in batches of `concurrency`, and return totals.
    ///
    /// Jobs re-scheduled with a backoff delay are not waited for.
    pub async fn run_until_idle(&self) -> DrainReport {
        let started = Instant::now();
        let mut report = DrainReport::default();

        loop {
            let mut tasks = JoinSet::new();
            for _ in 0..self.concurrency {
                match self.queue.claim().await {
                    Ok(Some(claimed)) => {
                        let runner = self.runner();
                        tasks.spawn(runner.execute(claimed, None));
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to claim job");
                        break;
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }
            tracing::debug!(claimed = tasks.len(), "Processing job batch");
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(Some(outcome)) => report.record(outcome),
                    other => log_join_result(other),
                }
            }
        }

        tracing::info!(
            completed = report.completed,
            retrying = report.retrying,
            dead = report.dead,
            duration_ms = started.elapsed().as_millis() as u64,
            "Queue drained"
        );
        report
    }

    fn runner(&self) -> JobRunner {
        JobRunner {
            queue: self.queue.clone(),
            pipeline: self.pipeline.clone(),
        }
    }
}

fn log_join_result(result: Result<Option<JobOutcome>, tokio::task::JoinError>) {
    if let Err(err) = result {
        tracing::error!(error = %err, "Job task aborted");
    }
}

/// Handles owned by one spawned job.
struct JobRunner {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<IngestionPipeline>,
}

impl JobRunner {
    /// Run one attempt and report it. `None` means the report itself failed.
    async fn execute(
        self,
        claimed: ClaimedJob,
        _permit: Option<OwnedSemaphorePermit>,
    ) -> Option<JobOutcome> {
        let started = Instant::now();
        let ClaimedJob { id, attempt, job } = claimed;
        tracing::info!(
            job_id = %id,
            attempt,
            tenant_id = job.tenant_id,
            document_id = %job.document_id,
            "Processing job"
        );

        let pipeline = self.pipeline.clone();
        let document_id = job.document_id.clone();
        // A panic inside the pipeline fails the attempt instead of leaving the lease to expire.
        let result = tokio::spawn(async move { pipeline.process(&job).await }).await;
        let error = match result {
            Ok(Ok(outcome)) => {
                if let Err(err) = self.queue.complete(id).await {
                    tracing::error!(job_id = %id, error = %err, "Failed to mark job as completed");
                    return None;
                }
                tracing::info!(
                    job_id = %id,
                    document_id = %document_id,
                    indexed = outcome.indexed,
                    skipped = outcome.skipped,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                return Some(JobOutcome::Completed);
            }
            Ok(Err(err)) => err.to_string(),
            Err(join_err) if join_err.is_panic() => "ingestion task panicked".to_string(),
            Err(join_err) => join_err.to_string(),
        };

        match self.queue.fail(id, &error).await {
            Ok(FailureDisposition::Retry(delay)) => {
                tracing::warn!(
                    job_id = %id,
                    document_id = %document_id,
                    attempt,
                    error = %error,
                    retry_in_secs = delay.as_secs(),
                    "Job failed; retry scheduled"
                );
                Some(JobOutcome::Retrying)
            }
            Ok(FailureDisposition::Dead) => {
                tracing::error!(
                    job_id = %id,
                    document_id = %document_id,
                    attempt,
                    error = %error,
                    "Job failed permanently"
                );
                Some(JobOutcome::Dead)
            }
            Err(err) => {
                tracing::error!(job_id = %id, error = %err, "Failed to mark job as failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingClient, EmbeddingClientError, HashingEmbedder};
    use crate::extract::minimal_pdf;
    use crate::index::InMemoryIndex;
    use crate::metrics::CodeMetrics;
    use crate::queue::{IngestJob, JobStatus, MemoryJobQueue, QueueError};
    use crate::storage::{BlobStore, LocalBlobStore, blob_key};
    use async_trait::async_trait;
    use uuid::Uuid;

    const DIM: usize = 16;

    struct PanickingEmbedder;

    #[async_trait]
    impl EmbeddingClient for PanickingEmbedder {
        fn dimension(&self) -> usize {
            DIM
        }

        async fn generate_embeddings(
            &self,
            _texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            panic!("embedding backend crashed");
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        blobs: Arc<LocalBlobStore>,
        queue: Arc<MemoryJobQueue>,
        index: Arc<InMemoryIndex>,
    }

    impl Harness {
        fn new(max_attempts: i32) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            Self {
                blobs: Arc::new(LocalBlobStore::new(dir.path())),
                _dir: dir,
                queue: Arc::new(MemoryJobQueue::new(max_attempts, Duration::from_secs(60))),
                index: Arc::new(InMemoryIndex::new(DIM)),
            }
        }

        fn worker(&self, embedder: Arc<dyn EmbeddingClient>, concurrency: usize) -> IngestionWorker {
            let pipeline = IngestionPipeline::new(
                self.blobs.clone(),
                embedder,
                self.index.clone(),
                Arc::new(CodeMetrics::new()),
                1000,
                200,
            );
            IngestionWorker::new(
                self.queue.clone(),
                Arc::new(pipeline),
                concurrency,
                Duration::from_millis(10),
            )
        }

        async fn enqueue(&self, document_id: &str, text: Option<&str>) -> Uuid {
            let key = blob_key(7, document_id);
            let locator = match text {
                Some(text) => self
                    .blobs
                    .put(&key, minimal_pdf(&[text]), "application/pdf")
                    .await
                    .expect("put"),
                None => crate::storage::StorageLocator {
                    provider: crate::config::StorageProviderKind::Local,
                    key,
                },
            };
            self.queue
                .enqueue(&IngestJob {
                    tenant_id: 7,
                    document_id: document_id.into(),
                    locator,
                    original_name: format!("{document_id}.pdf"),
                    size: 100,
                    content_type: "application/pdf".into(),
                })
                .await
                .expect("enqueue")
        }
    }

    #[tokio::test]
    async fn drain_processes_every_job_with_bounded_batches() {
        let harness = Harness::new(3);
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(
                harness
                    .enqueue(&format!("doc-{n}"), Some(&format!("Report number {n}")))
                    .await,
            );
        }

        let report = harness
            .worker(Arc::new(HashingEmbedder::new(DIM)), 2)
            .run_until_idle()
            .await;

        assert_eq!(report.completed, 5);
        for id in ids {
            assert_eq!(harness.queue.status(id).await, Some(JobStatus::Completed));
        }
        assert_eq!(harness.index.len().await, 5);
    }

    #[tokio::test]
    async fn missing_blob_is_reported_and_rescheduled() {
        let harness = Harness::new(3);
        let id = harness.enqueue("gone", None).await;

        let report = harness
            .worker(Arc::new(HashingEmbedder::new(DIM)), 1)
            .run_until_idle()
            .await;

        assert_eq!(report.retrying, 1);
        assert_eq!(harness.queue.status(id).await, Some(JobStatus::Pending));
        let error = harness.queue.last_error(id).await.expect("error recorded");
        assert!(error.contains("not found"), "{error}");
    }

    #[tokio::test]
    async fn panicking_job_is_failed_not_lost() {
        let harness = Harness::new(1);
        let id = harness.enqueue("boom", Some("Some text to embed")).await;

        let report = harness
            .worker(Arc::new(PanickingEmbedder), 1)
            .run_until_idle()
            .await;

        assert_eq!(report.dead, 1);
        assert_eq!(harness.queue.status(id).await, Some(JobStatus::Failed));
        assert_eq!(
            harness.queue.last_error(id).await.as_deref(),
            Some("ingestion task panicked")
        );
    }

    #[tokio::test]
    async fn run_processes_jobs_until_shutdown() {
        let harness = Harness::new(3);
        let worker = harness.worker(Arc::new(HashingEmbedder::new(DIM)), 4);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let queue = harness.queue.clone();

        let id = harness.enqueue("live", Some("Processed by the loop")).await;
        let watcher = async move {
            for _ in 0..500 {
                if queue.status(id).await == Some(JobStatus::Completed) {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
            let _ = stop_tx.send(());
        };

        tokio::join!(
            worker.run(async {
                let _ = stop_rx.await;
            }),
            watcher
        );

        assert_eq!(harness.queue.status(id).await, Some(JobStatus::Completed));
        assert_eq!(harness.index.count_for_document("live").await, 1);
    }

    struct UnreachableQueue;

    #[async_trait]
    impl JobQueue for UnreachableQueue {
        async fn enqueue(&self, _job: &IngestJob) -> Result<Uuid, QueueError> {
            Err(QueueError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
            Err(QueueError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn complete(&self, _id: Uuid) -> Result<(), QueueError> {
            Ok(())
        }

        async fn fail(&self, _id: Uuid, _error: &str) -> Result<FailureDisposition, QueueError> {
            Ok(FailureDisposition::Dead)
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_claim_error_backoff() {
        let harness = Harness::new(3);
        let pipeline = IngestionPipeline::new(
            harness.blobs.clone(),
            Arc::new(HashingEmbedder::new(DIM)),
            harness.index.clone(),
            Arc::new(CodeMetrics::new()),
            1000,
            200,
        );
        let worker = IngestionWorker::new(
            Arc::new(UnreachableQueue),
            Arc::new(pipeline),
            1,
            Duration::from_secs(3600),
        );

        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            worker.run(sleep(Duration::from_millis(20))),
        )
        .await;
        assert!(stopped.is_ok(), "worker kept sleeping after shutdown");
    }
}
