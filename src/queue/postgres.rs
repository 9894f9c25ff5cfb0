//! PostgreSQL-backed [`JobQueue`] using `FOR UPDATE SKIP LOCKED` claims.

use crate::queue::{ClaimedJob, FailureDisposition, IngestJob, JobQueue, QueueError, retry_delay};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Job queue stored in the `ingest_job` table.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    max_attempts: i32,
    lease: Duration,
}

impl PgJobQueue {
    /// Create a queue over `pool`.
    pub fn new(pool: PgPool, max_attempts: i32, lease: Duration) -> Self {
        Self {
            pool,
            max_attempts,
            lease,
        }
    }

    /// Mark jobs whose lease expired on their final attempt as failed.
    async fn reap_expired(&self) -> Result<(), QueueError> {
        let reaped = sqlx::query(
            "UPDATE ingest_job
             SET status = 'failed',
                 locked_until = NULL,
                 last_error = coalesce(last_error, 'lease expired'),
                 updated_at = now()
             WHERE status = 'running'
               AND locked_until < now()
               AND attempts >= max_attempts",
        )
        .execute(&self.pool)
        .await?;
        if reaped.rows_affected() > 0 {
            tracing::warn!(jobs = reaped.rows_affected(), "Expired jobs exhausted their attempts");
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: &IngestJob) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO ingest_job (id, payload, status, max_attempts)
             VALUES ($1, $2, 'pending', $3)",
        )
        .bind(id)
        .bind(serde_json::to_value(job)?)
        .bind(self.max_attempts)
        .execute(&self.pool)
        .await?;
        tracing::debug!(job_id = %id, document_id = %job.document_id, "Enqueued ingest job");
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        self.reap_expired().await?;

        let row = sqlx::query(
            "UPDATE ingest_job
             SET status = 'running',
                 attempts = attempts + 1,
                 locked_until = now() + make_interval(secs => $1),
                 updated_at = now()
             WHERE id = (
                 SELECT id FROM ingest_job
                 WHERE (status = 'pending' AND available_at <= now())
                    OR (status = 'running' AND locked_until < now())
                 ORDER BY available_at ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, payload, attempts",
        )
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: Uuid = row.try_get("id")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let attempt: i32 = row.try_get("attempts")?;
        match serde_json::from_value::<IngestJob>(payload) {
            Ok(job) => Ok(Some(ClaimedJob { id, attempt, job })),
            Err(err) => {
                // An undecodable payload can never succeed; retire it.
                sqlx::query(
                    "UPDATE ingest_job
                     SET status = 'failed', locked_until = NULL, last_error = $2, updated_at = now()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(err.to_string())
                .execute(&self.pool)
                .await?;
                Err(QueueError::Payload(err))
            }
        }
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE ingest_job
             SET status = 'completed', locked_until = NULL, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<FailureDisposition, QueueError> {
        let row = sqlx::query(
            "UPDATE ingest_job
             SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                 available_at = CASE
                     WHEN attempts >= max_attempts THEN available_at
                     ELSE now() + make_interval(secs => power(2, attempts))
                 END,
                 locked_until = NULL,
                 last_error = $2,
                 updated_at = now()
             WHERE id = $1
             RETURNING status, attempts",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NotFound(id))?;

        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts")?;
        if status == "failed" {
            Ok(FailureDisposition::Dead)
        } else {
            Ok(FailureDisposition::Retry(retry_delay(attempts)))
        }
    }
}
