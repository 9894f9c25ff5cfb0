//! Ingestion job queue.
//!
//! Delivery is at-least-once: a claimed job is leased, and a lease that expires before the job is
//! completed or failed makes it claimable again. Failed jobs are retried with exponential backoff
//! (`2^attempts` seconds) until the attempt budget is spent.

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobQueue;
pub use postgres::PgJobQueue;

use crate::storage::StorageLocator;
use crate::store::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by queue implementations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Database driver failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Job payload could not be encoded or decoded.
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// No job exists with the given id.
    #[error("job {0} not found")]
    NotFound(Uuid),
}

/// Work item describing one accepted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJob {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Document id the chunks are tagged with.
    pub document_id: String,
    /// Where the PDF bytes live.
    pub locator: StorageLocator,
    /// Filename supplied at upload.
    pub original_name: String,
    /// Size in bytes.
    pub size: i64,
    /// Content type accepted at upload.
    pub content_type: String,
}

/// A job handed to a consumer together with its delivery attempt number.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Queue-assigned id.
    pub id: Uuid,
    /// 1-based delivery attempt.
    pub attempt: i32,
    /// Job payload.
    pub job: IngestJob,
}

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting to be claimed (possibly after a backoff delay).
    Pending,
    /// Claimed and leased by a consumer.
    Running,
    /// Finished successfully.
    Completed,
    /// Attempt budget exhausted.
    Failed,
}

impl JobStatus {
    /// Persisted name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-queued after the given delay.
    Retry(Duration),
    /// Attempt budget exhausted; the job is marked failed.
    Dead,
}

/// Queue transport between the upload handler and the ingestion worker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job, returning its id.
    async fn enqueue(&self, job: &IngestJob) -> Result<Uuid, QueueError>;

    /// Lease the next available job, if any.
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError>;

    /// Mark a claimed job finished.
    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Report a failed attempt.
    async fn fail(&self, id: Uuid, error: &str) -> Result<FailureDisposition, QueueError>;
}

/// Delay before the next attempt after `attempts` deliveries.
pub fn retry_delay(attempts: i32) -> Duration {
    Duration::from_secs(1u64 << attempts.clamp(0, 16))
}
