//! Storage abstraction layer for the delivery engine.
//!
//! Provides trait-based abstractions over storage operations to enable
//! testability without database dependencies. Production implementations
//! use the concrete `pushline_core::storage::Storage` while tests can
//! provide mock implementations for deterministic behavior validation.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use pushline_core::{
    error::Result,
    models::{DeliveryJob, JobId, JobStatus, Notification, NotificationId, UserId},
};

/// Storage operations required by the delivery engine.
///
/// This trait abstracts all database operations needed for push delivery,
/// enabling both production PostgreSQL implementations and lightweight test
/// doubles. The separation allows testing dispatch logic, retry policy, and
/// error handling without database overhead.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Claims pending delivery jobs for processing.
    ///
    /// Uses FOR UPDATE SKIP LOCKED in production to enable lock-free
    /// concurrent claiming. Returns up to `batch_size` jobs in FIFO order.
    fn claim_pending_jobs(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>>;

    /// Claims one specific pending job.
    ///
    /// Used by the immediate-send path to take ownership of the job it just
    /// enqueued. Returns None if the job is not in the pending state.
    fn claim_job(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>>;

    /// Creates a notification and its delivery job atomically.
    fn create_notification_with_job(
        &self,
        notification: Notification,
        job: DeliveryJob,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Finds the notification a job delivers.
    fn find_notification(
        &self,
        id: NotificationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>>;

    /// Flips a notification's sent flag after a successful delivery.
    fn mark_sent(
        &self,
        id: NotificationId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks a claimed job as completed with the gateway message ID.
    fn mark_completed(
        &self,
        job_id: JobId,
        message_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks a claimed job as terminally failed (no delivery possible).
    fn mark_failed(
        &self,
        job_id: JobId,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns a claimed job to the queue with an advanced retry counter.
    fn requeue(
        &self,
        job_id: JobId,
        retries: i32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Moves a claimed job to the dead-letter queue.
    fn mark_dead_letter(
        &self,
        job_id: JobId,
        retries: i32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Requeues jobs stranded in processing by a crashed worker.
    ///
    /// Returns the number of jobs released back to pending.
    fn release_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Finds a job by ID.
    fn find_job(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>>;

    /// Finds the current status of a job.
    ///
    /// Used for verification in tests and monitoring the job lifecycle.
    fn find_job_status(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + '_>>;

    /// Lists a user's notifications, newest first, excluding soft-deleted.
    fn find_notifications_by_user(
        &self,
        user_id: UserId,
        limit: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>>;

    /// Marks a user's notifications as read. Returns rows updated.
    fn mark_read(
        &self,
        user_id: UserId,
        ids: Vec<NotificationId>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Soft-deletes a user's notification.
    fn soft_delete_notification(
        &self,
        user_id: UserId,
        id: NotificationId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
///
/// Wraps the concrete `pushline_core::storage::Storage` to implement the
/// `DeliveryStorage` trait. All database operations go through the
/// repository pattern for consistency and type safety.
pub struct PostgresDeliveryStorage {
    storage: Arc<pushline_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<pushline_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn claim_pending_jobs(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.claim_pending(batch_size).await })
    }

    fn claim_job(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.claim_one(job_id).await })
    }

    fn create_notification_with_job(
        &self,
        notification: Notification,
        job: DeliveryJob,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.create_notification_with_job(&notification, &job).await })
    }

    fn find_notification(
        &self,
        id: NotificationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.find_by_id(id).await })
    }

    fn mark_sent(
        &self,
        id: NotificationId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.mark_sent(id).await })
    }

    fn mark_completed(
        &self,
        job_id: JobId,
        message_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.mark_completed(job_id, &message_id).await })
    }

    fn mark_failed(
        &self,
        job_id: JobId,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.mark_failed(job_id, &error).await })
    }

    fn requeue(
        &self,
        job_id: JobId,
        retries: i32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.requeue(job_id, retries, &error).await })
    }

    fn mark_dead_letter(
        &self,
        job_id: JobId,
        retries: i32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.mark_dead_letter(job_id, retries, &error).await })
    }

    fn release_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.release_stale(older_than).await })
    }

    fn find_job(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.find_by_id(job_id).await })
    }

    fn find_job_status(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .jobs
                .find_by_id(job_id)
                .await?
                .ok_or_else(|| {
                    pushline_core::CoreError::NotFound(format!("delivery job {job_id}"))
                })
                .map(|job| job.status)
        })
    }

    fn find_notifications_by_user(
        &self,
        user_id: UserId,
        limit: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.find_by_user(user_id, limit, since).await })
    }

    fn mark_read(
        &self,
        user_id: UserId,
        ids: Vec<NotificationId>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.mark_read(user_id, &ids).await })
    }

    fn soft_delete_notification(
        &self,
        user_id: UserId,
        id: NotificationId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.soft_delete(user_id, id).await })
    }
}

pub mod mock {
    //! Mock storage implementation for testing.
    //!
    //! Provides deterministic, in-memory storage for testing delivery logic
    //! without database dependencies. State transitions carry the same
    //! guards as the SQL statements: terminal job states are never exited,
    //! and outcome updates only apply to claimed jobs.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use pushline_core::error::{CoreError, Result};
    use tokio::sync::RwLock;

    use super::{DeliveryJob, DeliveryStorage, JobId, JobStatus, Notification, NotificationId, UserId};

    /// Mock storage for testing delivery logic without a database.
    pub struct MockDeliveryStorage {
        notifications: Arc<RwLock<HashMap<NotificationId, Notification>>>,
        jobs: Arc<RwLock<HashMap<JobId, DeliveryJob>>>,
        pending: Arc<RwLock<Vec<JobId>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        completed_error: Arc<RwLock<Option<String>>>,
        steal_next_claim: Arc<RwLock<bool>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self {
                notifications: Arc::new(RwLock::new(HashMap::new())),
                jobs: Arc::new(RwLock::new(HashMap::new())),
                pending: Arc::new(RwLock::new(Vec::new())),
                claim_error: Arc::new(RwLock::new(None)),
                completed_error: Arc::new(RwLock::new(None)),
                steal_next_claim: Arc::new(RwLock::new(false)),
            }
        }

        /// Seeds a notification with a pending delivery job.
        pub async fn add_pending(&self, notification: Notification, job: DeliveryJob) {
            self.notifications.write().await.insert(notification.id, notification);
            self.pending.write().await.push(job.id);
            self.jobs.write().await.insert(job.id, job);
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: String) {
            *self.claim_error.write().await = Some(error);
        }

        /// Injects an error for the next job completion write.
        pub async fn inject_completed_error(&self, error: String) {
            *self.completed_error.write().await = Some(error);
        }

        /// Makes the next targeted claim lose to a concurrent worker.
        ///
        /// The job moves to processing as if a polling worker had taken it,
        /// but the caller's claim comes back empty.
        pub async fn steal_next_claim(&self) {
            *self.steal_next_claim.write().await = true;
        }

        /// Returns the current state of a job.
        pub async fn job(&self, job_id: JobId) -> Option<DeliveryJob> {
            self.jobs.read().await.get(&job_id).cloned()
        }

        /// Returns the current state of a notification.
        pub async fn notification(&self, id: NotificationId) -> Option<Notification> {
            self.notifications.read().await.get(&id).cloned()
        }

        /// Verifies a job reached the expected status.
        pub async fn verify_job_status(&self, job_id: JobId, expected: JobStatus) -> bool {
            self.jobs.read().await.get(&job_id).is_some_and(|j| j.status == expected)
        }
    }

    impl Default for MockDeliveryStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn claim_pending_jobs(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>> {
            let claim_error = self.claim_error.clone();
            let pending = self.pending.clone();
            let jobs = self.jobs.clone();

            Box::pin(async move {
                let error = claim_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Database(error));
                }

                let claimed_ids: Vec<JobId> = {
                    let mut queue = pending.write().await;
                    let take = batch_size.min(queue.len());
                    queue.drain(..take).collect()
                };

                let mut jobs_map = jobs.write().await;
                let mut claimed = Vec::with_capacity(claimed_ids.len());
                for id in claimed_ids {
                    if let Some(job) = jobs_map.get_mut(&id) {
                        if job.status == JobStatus::Pending {
                            job.status = JobStatus::Processing;
                            job.processing_at = Some(Utc::now());
                            claimed.push(job.clone());
                        }
                    }
                }

                Ok(claimed)
            })
        }

        fn claim_job(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>> {
            let pending = self.pending.clone();
            let jobs = self.jobs.clone();
            let steal = self.steal_next_claim.clone();

            Box::pin(async move {
                let mut jobs_map = jobs.write().await;
                let Some(job) = jobs_map.get_mut(&job_id) else { return Ok(None) };
                if job.status != JobStatus::Pending {
                    return Ok(None);
                }

                job.status = JobStatus::Processing;
                job.processing_at = Some(Utc::now());
                pending.write().await.retain(|id| *id != job_id);

                if std::mem::take(&mut *steal.write().await) {
                    // A scripted worker won the race; the job is claimed but
                    // not by this caller.
                    return Ok(None);
                }

                Ok(Some(job.clone()))
            })
        }

        fn create_notification_with_job(
            &self,
            notification: Notification,
            job: DeliveryJob,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let notifications = self.notifications.clone();
            let pending = self.pending.clone();
            let jobs = self.jobs.clone();

            Box::pin(async move {
                notifications.write().await.insert(notification.id, notification);
                if job.status == JobStatus::Pending {
                    pending.write().await.push(job.id);
                }
                jobs.write().await.insert(job.id, job);
                Ok(())
            })
        }

        fn find_notification(
            &self,
            id: NotificationId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>> {
            let notifications = self.notifications.clone();
            Box::pin(async move { Ok(notifications.read().await.get(&id).cloned()) })
        }

        fn mark_sent(
            &self,
            id: NotificationId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let notifications = self.notifications.clone();
            Box::pin(async move {
                if let Some(notification) = notifications.write().await.get_mut(&id) {
                    if !notification.sent {
                        notification.sent = true;
                        notification.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
        }

        fn mark_completed(
            &self,
            job_id: JobId,
            message_id: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let completed_error = self.completed_error.clone();
            Box::pin(async move {
                let error = completed_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Database(error));
                }

                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    if job.status == JobStatus::Processing {
                        job.status = JobStatus::Completed;
                        job.message_id = Some(message_id);
                        job.last_error = None;
                        job.processing_at = None;
                        job.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            job_id: JobId,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    if job.status == JobStatus::Processing {
                        job.status = JobStatus::Failed;
                        job.last_error = Some(error);
                        job.processing_at = None;
                        job.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
        }

        fn requeue(
            &self,
            job_id: JobId,
            retries: i32,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let pending = self.pending.clone();
            let jobs = self.jobs.clone();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    if job.status == JobStatus::Processing {
                        job.status = JobStatus::Pending;
                        job.retries = retries;
                        job.last_error = Some(error);
                        job.processing_at = None;
                        job.updated_at = Utc::now();
                        pending.write().await.push(job_id);
                    }
                }
                Ok(())
            })
        }

        fn mark_dead_letter(
            &self,
            job_id: JobId,
            retries: i32,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    if job.status == JobStatus::Processing {
                        job.status = JobStatus::DeadLetter;
                        job.retries = retries;
                        job.last_error = Some(error);
                        job.processing_at = None;
                        job.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
        }

        fn release_stale(
            &self,
            older_than: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let pending = self.pending.clone();
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let mut released = 0u64;
                let mut jobs_map = jobs.write().await;
                let mut queue = pending.write().await;

                for (id, job) in jobs_map.iter_mut() {
                    let stale = job.status == JobStatus::Processing
                        && job.processing_at.is_some_and(|at| at < older_than);
                    if stale {
                        job.status = JobStatus::Pending;
                        job.processing_at = None;
                        job.updated_at = Utc::now();
                        queue.push(*id);
                        released += 1;
                    }
                }

                Ok(released)
            })
        }

        fn find_job(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move { Ok(jobs.read().await.get(&job_id).cloned()) })
        }

        fn find_job_status(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                jobs.read()
                    .await
                    .get(&job_id)
                    .map(|j| j.status)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery job {job_id}")))
            })
        }

        fn find_notifications_by_user(
            &self,
            user_id: UserId,
            limit: Option<i64>,
            since: Option<DateTime<Utc>>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>> {
            let notifications = self.notifications.clone();
            Box::pin(async move {
                let mut matching: Vec<Notification> = notifications
                    .read()
                    .await
                    .values()
                    .filter(|n| n.user_id == user_id && !n.deleted)
                    .filter(|n| since.map_or(true, |s| n.created_at > s))
                    .cloned()
                    .collect();

                matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                let limit = usize::try_from(limit.unwrap_or(100)).unwrap_or(usize::MAX);
                matching.truncate(limit);
                Ok(matching)
            })
        }

        fn mark_read(
            &self,
            user_id: UserId,
            ids: Vec<NotificationId>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let notifications = self.notifications.clone();
            Box::pin(async move {
                let mut updated = 0u64;
                let mut map = notifications.write().await;
                for id in ids {
                    if let Some(n) = map.get_mut(&id) {
                        if n.user_id == user_id && !n.deleted {
                            n.read = true;
                            n.updated_at = Utc::now();
                            updated += 1;
                        }
                    }
                }
                Ok(updated)
            })
        }

        fn soft_delete_notification(
            &self,
            user_id: UserId,
            id: NotificationId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let notifications = self.notifications.clone();
            Box::pin(async move {
                let mut map = notifications.write().await;
                match map.get_mut(&id) {
                    Some(n) if n.user_id == user_id && !n.deleted => {
                        n.deleted = true;
                        n.updated_at = Utc::now();
                        Ok(())
                    },
                    _ => Err(CoreError::NotFound(format!("notification {id}"))),
                }
            })
        }
    }
}
