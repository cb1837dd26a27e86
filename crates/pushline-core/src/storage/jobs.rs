//! Repository for delivery job database operations.
//!
//! Provides type-safe access to delivery jobs with support for concurrent
//! claiming, retry bookkeeping, and terminal state transitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryJob, JobId},
};

const JOB_COLUMNS: &str = "id, notification_id, status, retries, last_error, message_id, \
                           created_at, processing_at, updated_at";

/// Repository for delivery job database operations.
///
/// Handles all database interactions for delivery jobs including creation,
/// atomic claiming, and the retry/dead-letter state machine.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Claims pending jobs for delivery processing.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` to enable lock-free concurrent claiming
    /// across multiple workers without blocking. Each worker claims a
    /// disjoint set of jobs; a job can never be processed twice in parallel.
    ///
    /// Jobs are claimed in FIFO order (oldest first). Requeued jobs keep
    /// their original `created_at`, so retries do not jump the queue.
    ///
    /// # Errors
    ///
    /// Returns error if database transaction fails.
    pub async fn claim_pending(&self, batch_size: usize) -> Result<Vec<DeliveryJob>> {
        let mut tx = self.pool.begin().await?;

        let job_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM notification_jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch_size as i32)
        .fetch_all(&mut *tx)
        .await?;

        if job_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            UPDATE notification_jobs
            SET status = 'processing', processing_at = NOW(), updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(&job_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(jobs)
    }

    /// Claims one specific pending job.
    ///
    /// Used by the immediate-send path to take exclusive ownership of the
    /// job it just enqueued. Returns None if the job was already claimed by
    /// a worker or does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn claim_one(&self, job_id: JobId) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            UPDATE notification_jobs
            SET status = 'processing', processing_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(job_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Creates a delivery job within a transaction.
    ///
    /// Jobs are only ever created alongside their notification, so there is
    /// no standalone insert path.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &DeliveryJob,
    ) -> Result<JobId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO notification_jobs (
                id, notification_id, status, retries, last_error, message_id,
                created_at, processing_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9
            )
            RETURNING id
            "#,
        )
        .bind(job.id.0)
        .bind(job.notification_id.0)
        .bind(job.status.to_string())
        .bind(job.retries)
        .bind(&job.last_error)
        .bind(&job.message_id)
        .bind(job.created_at)
        .bind(job.processing_at)
        .bind(job.updated_at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(JobId(id))
    }

    /// Finds a job by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, job_id: JobId) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM notification_jobs
            WHERE id = $1
            "#,
        ))
        .bind(job_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Marks a claimed job as successfully completed.
    ///
    /// Records the provider message ID and clears the claim timestamp. Only
    /// applies to jobs currently in `processing`; a job that reached a
    /// terminal state through another path is left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_completed(&self, job_id: JobId, message_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'completed',
                message_id = $1,
                last_error = NULL,
                processing_at = NULL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'processing'
            "#,
        )
        .bind(message_id)
        .bind(job_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a claimed job as terminally failed.
    ///
    /// Used when no delivery attempt is possible (recipient has no device
    /// tokens). The retry counter is not advanced; this state is final.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'failed',
                last_error = $1,
                processing_at = NULL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'processing'
            "#,
        )
        .bind(error)
        .bind(job_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns a claimed job to the queue after a retryable failure.
    ///
    /// Persists the advanced retry counter and the error message. The job
    /// becomes eligible for claiming again on the next poll.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn requeue(&self, job_id: JobId, retries: i32, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'pending',
                retries = $1,
                last_error = $2,
                processing_at = NULL,
                updated_at = NOW()
            WHERE id = $3 AND status = 'processing'
            "#,
        )
        .bind(retries)
        .bind(error)
        .bind(job_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Moves a claimed job to the dead-letter queue.
    ///
    /// Terminal state for jobs whose retries are exhausted. The final retry
    /// count and error are preserved for inspection.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_dead_letter(&self, job_id: JobId, retries: i32, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'dead_letter',
                retries = $1,
                last_error = $2,
                processing_at = NULL,
                updated_at = NOW()
            WHERE id = $3 AND status = 'processing'
            "#,
        )
        .bind(retries)
        .bind(error)
        .bind(job_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Requeues jobs stranded in `processing` by a crashed worker.
    ///
    /// A job claimed before `older_than` with no recorded outcome is
    /// returned to `pending` without advancing its retry counter, since no
    /// delivery result was observed. Returns the number of jobs released.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'pending',
                processing_at = NULL,
                updated_at = NOW()
            WHERE status = 'processing' AND processing_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
