//! In-process [`JobQueue`] with lease and backoff semantics matching the PostgreSQL queue.

use crate::queue::{
    ClaimedJob, FailureDisposition, IngestJob, JobQueue, JobStatus, QueueError, retry_delay,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

struct Entry {
    id: Uuid,
    job: IngestJob,
    status: JobStatus,
    attempts: i32,
    available_at: Instant,
    locked_until: Option<Instant>,
    last_error: Option<String>,
}

impl Entry {
    fn claimable(&self, now: Instant) -> bool {
        match self.status {
            JobStatus::Pending => self.available_at <= now,
            JobStatus::Running => self.locked_until.is_some_and(|until| until < now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }
}

/// FIFO job queue held in memory.
pub struct MemoryJobQueue {
    entries: Mutex<Vec<Entry>>,
    max_attempts: i32,
    lease: Duration,
}

impl MemoryJobQueue {
    /// Create an empty queue.
    pub fn new(max_attempts: i32, lease: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_attempts: max_attempts.max(1),
            lease,
        }
    }

    /// Current status of a job.
    pub async fn status(&self, id: Uuid) -> Option<JobStatus> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.status)
    }

    /// Last recorded failure message of a job.
    pub async fn last_error(&self, id: Uuid) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|entry| entry.id == id)
            .and_then(|entry| entry.last_error.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &IngestJob) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        self.entries.lock().await.push(Entry {
            id,
            job: job.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            available_at: Instant::now(),
            locked_until: None,
            last_error: None,
        });
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        for entry in entries.iter_mut() {
            if entry.status == JobStatus::Running
                && entry.claimable(now)
                && entry.attempts >= self.max_attempts
            {
                entry.status = JobStatus::Failed;
                entry.locked_until = None;
                entry
                    .last_error
                    .get_or_insert_with(|| "lease expired".to_string());
            }
        }

        let Some(entry) = entries.iter_mut().find(|entry| entry.claimable(now)) else {
            return Ok(None);
        };
        entry.status = JobStatus::Running;
        entry.attempts += 1;
        entry.locked_until = Some(now + self.lease);
        Ok(Some(ClaimedJob {
            id: entry.id,
            attempt: entry.attempts,
            job: entry.job.clone(),
        }))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(QueueError::NotFound(id))?;
        entry.status = JobStatus::Completed;
        entry.locked_until = None;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<FailureDisposition, QueueError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(QueueError::NotFound(id))?;
        entry.locked_until = None;
        entry.last_error = Some(error.to_string());

        if entry.attempts >= self.max_attempts {
            entry.status = JobStatus::Failed;
            return Ok(FailureDisposition::Dead);
        }
        let delay = retry_delay(entry.attempts);
        entry.status = JobStatus::Pending;
        entry.available_at = Instant::now() + delay;
        Ok(FailureDisposition::Retry(delay))
    }
}
