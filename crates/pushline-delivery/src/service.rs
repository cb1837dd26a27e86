//! Application-facing notification operations.
//!
//! Covers creating notifications (queued for the polling workers),
//! sending immediately, and the user-scoped read/list/delete operations.
//! The immediate path runs the same dispatch pipeline as the workers, so
//! both leave identical job and notification state behind.

use std::{collections::HashMap, sync::Arc};

use pushline_core::{
    models::{DeliveryJob, JobId, Notification, NotificationId, UserId},
    Clock,
};
use tracing::{info, warn};

use crate::{
    dispatch::{DispatchOutcome, Dispatcher},
    error::{DeliveryError, Result},
    gateway::PushGateway,
    retry::RetryPolicy,
    storage::DeliveryStorage,
    tokens::TokenResolver,
};

/// Result of an immediate send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// The notification that was created and dispatched.
    pub notification_id: NotificationId,
    /// Tokens the gateway accepted.
    pub success_count: usize,
    /// Tokens that did not receive the push.
    pub failure_count: usize,
    /// True when this call did not settle delivery and the polling workers
    /// carry it forward. Distinguishes a pending retry (or a claim lost to a
    /// racing worker) from a final failure.
    pub in_background: bool,
}

/// Service for creating and managing notifications.
///
/// Queued sends only persist state; delivery happens asynchronously in the
/// engine's workers. Immediate sends dispatch inline on the caller's task.
pub struct NotificationService {
    storage: Arc<dyn DeliveryStorage>,
    tokens: Arc<dyn TokenResolver>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    /// Creates a service over the given storage, resolver, and gateway.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        tokens: Arc<dyn TokenResolver>,
        gateway: Arc<dyn PushGateway>,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher =
            Dispatcher::new(storage.clone(), tokens.clone(), gateway, retry_policy);
        Self { storage, tokens, dispatcher, clock }
    }

    /// Creates a notification and queues it for delivery.
    ///
    /// The notification and its pending job are persisted atomically;
    /// either both exist or neither does. Delivery concerns (missing
    /// tokens, gateway health) never fail this call.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Database` if persistence fails.
    pub async fn create_notification(
        &self,
        user_id: UserId,
        title: String,
        body: String,
        metadata: HashMap<String, String>,
    ) -> Result<Notification> {
        let now = self.clock.now_utc();
        let notification =
            Notification::new(NotificationId::new(), user_id, title, body, metadata, now);
        let job = DeliveryJob::new(JobId::new(), notification.id, now);

        self.storage.create_notification_with_job(notification.clone(), job).await?;

        info!(
            notification_id = %notification.id,
            user_id = %user_id,
            "notification queued for delivery"
        );

        Ok(notification)
    }

    /// Creates a notification and delivers it inline.
    ///
    /// Tokens are resolved before anything is persisted: a recipient with
    /// no registered devices gets an error and no record. Otherwise the
    /// notification and job are stored exactly as the queued path stores
    /// them, the job is claimed, and one dispatch runs on this task. A full
    /// delivery failure leaves the job to the polling workers for retry.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NoDeviceTokens` if the user has no
    /// registered devices, or `DeliveryError::Database` if persistence
    /// fails.
    pub async fn send_now(
        &self,
        user_id: UserId,
        title: String,
        body: String,
        metadata: HashMap<String, String>,
    ) -> Result<SendReport> {
        let device_tokens = self.tokens.tokens_for(user_id).await?;
        if device_tokens.is_empty() {
            return Err(DeliveryError::no_device_tokens(user_id));
        }
        let token_count = device_tokens.len();

        let now = self.clock.now_utc();
        let notification =
            Notification::new(NotificationId::new(), user_id, title, body, metadata, now);
        let job = DeliveryJob::new(JobId::new(), notification.id, now);
        let job_id = job.id;

        self.storage.create_notification_with_job(notification.clone(), job).await?;

        let Some(claimed) = self.storage.claim_job(job_id).await? else {
            // A worker polling at exactly the wrong moment can win the
            // claim; the push still goes out, just not on this task.
            warn!(
                notification_id = %notification.id,
                job_id = %job_id,
                "immediate send lost its claim, delivery continues in the background"
            );
            return Ok(SendReport {
                notification_id: notification.id,
                success_count: 0,
                failure_count: 0,
                in_background: true,
            });
        };

        let outcome = self.dispatcher.dispatch(&claimed).await?;

        let report = match outcome {
            DispatchOutcome::Completed { success_count, failure_count, .. } => SendReport {
                notification_id: notification.id,
                success_count,
                failure_count,
                in_background: false,
            },
            DispatchOutcome::Requeued { .. } => SendReport {
                notification_id: notification.id,
                success_count: 0,
                failure_count: token_count,
                in_background: true,
            },
            DispatchOutcome::DeadLettered { .. } | DispatchOutcome::Failed { .. } => SendReport {
                notification_id: notification.id,
                success_count: 0,
                failure_count: token_count,
                in_background: false,
            },
        };

        Ok(report)
    }

    /// Lists a user's notifications, newest first.
    ///
    /// Soft-deleted notifications are excluded. `since` filters to
    /// notifications created strictly after the given instant.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Database` if the query fails.
    pub async fn user_notifications(
        &self,
        user_id: UserId,
        limit: Option<i64>,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Notification>> {
        Ok(self.storage.find_notifications_by_user(user_id, limit, since).await?)
    }

    /// Marks the given notifications as read for the user.
    ///
    /// IDs belonging to other users or already deleted are silently
    /// skipped. Returns the number of notifications updated.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Database` if the update fails.
    pub async fn mark_read(&self, user_id: UserId, ids: Vec<NotificationId>) -> Result<u64> {
        Ok(self.storage.mark_read(user_id, ids).await?)
    }

    /// Soft-deletes a user's notification.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the notification does not exist,
    /// belongs to another user, or was already deleted.
    pub async fn delete_notification(&self, user_id: UserId, id: NotificationId) -> Result<()> {
        Ok(self.storage.soft_delete_notification(user_id, id).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pushline_core::{
        models::{JobStatus, Platform},
        RealClock,
    };

    use super::*;
    use crate::{
        gateway::mock::MockPushGateway, storage::mock::MockDeliveryStorage,
        tokens::mock::StaticTokenResolver,
    };

    struct TestService {
        service: NotificationService,
        storage: Arc<MockDeliveryStorage>,
        tokens: Arc<StaticTokenResolver>,
        gateway: Arc<MockPushGateway>,
    }

    fn test_service() -> TestService {
        let storage = Arc::new(MockDeliveryStorage::new());
        let tokens = Arc::new(StaticTokenResolver::new());
        let gateway = Arc::new(MockPushGateway::new());
        let service = NotificationService::new(
            storage.clone(),
            tokens.clone(),
            gateway.clone(),
            RetryPolicy::default(),
            Arc::new(RealClock::new()),
        );
        TestService { service, storage, tokens, gateway }
    }

    #[tokio::test]
    async fn create_notification_queues_a_pending_job() {
        let t = test_service();
        let user = UserId::new();

        let notification = t
            .service
            .create_notification(user, "hi".into(), "there".into(), HashMap::new())
            .await
            .unwrap();

        assert!(!notification.sent);
        // The job is queued, not delivered inline.
        assert_eq!(t.gateway.call_count().await, 0);

        let claimed = t.storage.claim_pending_jobs(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].notification_id, notification.id);
    }

    #[tokio::test]
    async fn send_now_delivers_inline() {
        let t = test_service();
        let user = UserId::new();
        t.tokens.register(user, "tok-1", Platform::Android).await;
        t.tokens.register(user, "tok-2", Platform::Ios).await;

        let report = t
            .service
            .send_now(user, "hi".into(), "there".into(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 0);
        assert!(!report.in_background);
        assert_eq!(t.gateway.call_count().await, 1);

        let notification = t.storage.notification(report.notification_id).await.unwrap();
        assert!(notification.sent);

        // Nothing left for the polling workers.
        assert!(t.storage.claim_pending_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_now_without_tokens_persists_nothing() {
        let t = test_service();
        let user = UserId::new();

        let result =
            t.service.send_now(user, "hi".into(), "there".into(), HashMap::new()).await;

        assert!(matches!(result, Err(DeliveryError::NoDeviceTokens { .. })));
        assert_eq!(t.gateway.call_count().await, 0);
        assert!(t.service.user_notifications(user, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_now_full_failure_leaves_job_queued_for_retry() {
        let t = test_service();
        let user = UserId::new();
        t.tokens.register(user, "tok-1", Platform::Web).await;
        t.gateway.enqueue_error(DeliveryError::transport("connection reset")).await;

        let report = t
            .service
            .send_now(user, "hi".into(), "there".into(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.success_count, 0);
        assert_eq!(report.failure_count, 1);
        // The retry is the workers' problem now.
        assert!(report.in_background);

        let claimed = t.storage.claim_pending_jobs(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retries, 1);
        assert!(!t.storage.notification(report.notification_id).await.unwrap().sent);
    }

    #[tokio::test]
    async fn send_now_losing_the_claim_reports_background_delivery() {
        let t = test_service();
        let user = UserId::new();
        t.tokens.register(user, "tok-1", Platform::Android).await;
        t.storage.steal_next_claim().await;

        let report = t
            .service
            .send_now(user, "hi".into(), "there".into(), HashMap::new())
            .await
            .unwrap();

        // No inline attempt happened; the winning worker owns delivery.
        assert_eq!(report.success_count, 0);
        assert_eq!(report.failure_count, 0);
        assert!(report.in_background);
        assert_eq!(t.gateway.call_count().await, 0);

        let notification = t.storage.notification(report.notification_id).await.unwrap();
        assert!(!notification.sent);
    }

    #[tokio::test]
    async fn listing_excludes_deleted_and_honors_since() {
        let t = test_service();
        let user = UserId::new();
        t.tokens.register(user, "tok-1", Platform::Android).await;

        let first = t
            .service
            .create_notification(user, "a".into(), "1".into(), HashMap::new())
            .await
            .unwrap();
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = t
            .service
            .create_notification(user, "b".into(), "2".into(), HashMap::new())
            .await
            .unwrap();

        let all = t.service.user_notifications(user, None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].id, second.id);

        let recent = t.service.user_notifications(user, None, Some(cutoff)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, second.id);

        t.service.delete_notification(user, second.id).await.unwrap();
        let remaining = t.service.user_notifications(user, None, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, first.id);
    }

    #[tokio::test]
    async fn mark_read_is_scoped_to_the_user() {
        let t = test_service();
        let owner = UserId::new();
        let stranger = UserId::new();

        let notification = t
            .service
            .create_notification(owner, "a".into(), "1".into(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(t.service.mark_read(stranger, vec![notification.id]).await.unwrap(), 0);
        assert_eq!(t.service.mark_read(owner, vec![notification.id]).await.unwrap(), 1);

        let listed = t.service.user_notifications(owner, None, None).await.unwrap();
        assert!(listed[0].read);
    }

    #[tokio::test]
    async fn deleting_a_foreign_notification_is_not_found() {
        let t = test_service();
        let owner = UserId::new();
        let stranger = UserId::new();

        let notification = t
            .service
            .create_notification(owner, "a".into(), "1".into(), HashMap::new())
            .await
            .unwrap();

        let result = t.service.delete_notification(stranger, notification.id).await;
        assert!(matches!(result, Err(DeliveryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn send_now_requeued_job_is_deliverable_by_workers() {
        let t = test_service();
        let user = UserId::new();
        t.tokens.register(user, "tok-1", Platform::Android).await;
        t.gateway.enqueue_all_failed("Unavailable").await;

        let report = t
            .service
            .send_now(user, "hi".into(), "there".into(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(report.success_count, 0);

        // The requeued job succeeds on the next (unscripted) attempt.
        let claimed = t.storage.claim_pending_jobs(10).await.unwrap();
        let dispatcher = Dispatcher::new(
            t.storage.clone(),
            t.tokens.clone(),
            t.gateway.clone(),
            RetryPolicy::default(),
        );
        let outcome = dispatcher.dispatch(&claimed[0]).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Completed { .. }));
        assert!(t.storage.verify_job_status(claimed[0].id, JobStatus::Completed).await);
    }
}
