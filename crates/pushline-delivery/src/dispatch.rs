//! Single-job dispatch pipeline.
//!
//! Takes one claimed job through token resolution, the multicast gateway
//! call, and the resulting status transition. The same pipeline serves the
//! polling workers and the immediate-send path, so every delivery leaves
//! identical audit state regardless of how it was triggered.

use std::{collections::HashMap, sync::Arc};

use pushline_core::models::{DeliveryJob, Notification};
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, ErrorCategory, Result},
    gateway::{PushGateway, PushMessage},
    retry::{RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
    tokens::TokenResolver,
};

/// Reserved metadata key carrying the notification ID to the client.
///
/// The dispatch path always writes this key into the push payload,
/// overwriting any caller-supplied value, so client applications can
/// deep-link from a push back to the notification record.
pub const NOTIFICATION_ID_KEY: &str = "notificationId";

/// What became of a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one device accepted the push; the job is done.
    Completed {
        /// Provider message ID recorded on the job
        message_id: String,
        /// Tokens the gateway accepted
        success_count: usize,
        /// Tokens the gateway rejected
        failure_count: usize,
    },
    /// The job failed terminally without a delivery being possible.
    Failed {
        /// Reason recorded as the job's last error
        reason: String,
    },
    /// The attempt failed; the job went back to the queue.
    Requeued {
        /// Retry counter persisted on the job
        retries: i32,
    },
    /// The attempt budget is exhausted; the job moved to the dead-letter
    /// queue.
    DeadLettered {
        /// Retry counter persisted on the job
        retries: i32,
    },
}

/// Delivers one claimed job and persists the resulting state transition.
///
/// Holds the injected gateway and token resolver so tests can script both
/// seams without touching a network or a database.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn DeliveryStorage>,
    tokens: Arc<dyn TokenResolver>,
    gateway: Arc<dyn PushGateway>,
    retry_policy: RetryPolicy,
}

impl Dispatcher {
    /// Creates a dispatcher over the given storage, resolver, and gateway.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        tokens: Arc<dyn TokenResolver>,
        gateway: Arc<dyn PushGateway>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self { storage, tokens, gateway, retry_policy }
    }

    /// Delivers one claimed job.
    ///
    /// The job must be in the processing state; every path through this
    /// method persists a state transition before returning, so a job never
    /// comes back from a completed dispatch still claimed.
    ///
    /// # Errors
    ///
    /// Returns error only when persisting the transition fails. Gateway and
    /// token failures are absorbed into the returned outcome.
    pub async fn dispatch(&self, job: &DeliveryJob) -> Result<DispatchOutcome> {
        let Some(notification) = self
            .storage
            .find_notification(job.notification_id)
            .await
            .map_err(|e| DeliveryError::database(format!("notification lookup failed: {e}")))?
        else {
            // Orphaned job; nothing to deliver and nothing to retry.
            let reason = format!("notification {} not found", job.notification_id);
            self.fail_terminal(job, &reason).await?;
            return Ok(DispatchOutcome::Failed { reason });
        };

        let device_tokens = match self.tokens.tokens_for(notification.user_id).await {
            Ok(tokens) => tokens,
            Err(error) => return self.handle_failure(job, &error).await,
        };

        if device_tokens.is_empty() {
            let reason =
                format!("no device tokens registered for user {}", notification.user_id);
            self.fail_terminal(job, &reason).await?;
            warn!(
                job_id = %job.id,
                notification_id = %notification.id,
                user_id = %notification.user_id,
                "no device tokens, job failed terminally"
            );
            return Ok(DispatchOutcome::Failed { reason });
        }

        let message = Self::build_message(&notification, &device_tokens);

        match self.gateway.send_multicast(&message).await {
            Ok(outcome) if outcome.is_all_failed() => {
                let error_codes: Vec<&str> = outcome
                    .results
                    .iter()
                    .filter_map(|r| r.error_code.as_deref())
                    .collect();
                warn!(
                    job_id = %job.id,
                    notification_id = %notification.id,
                    ?error_codes,
                    "gateway rejected every token"
                );
                let error = DeliveryError::all_tokens_failed(outcome.failure_count);
                self.handle_failure(job, &error).await
            },
            Ok(outcome) => {
                let message_id = outcome.primary_message_id();
                // The sent flag goes first. If the completion write is lost
                // the job stays claimed and is retried after the stale sweep,
                // so the worst case is a duplicate push, never a completed
                // job whose notification still reads as unsent.
                self.storage
                    .mark_sent(notification.id)
                    .await
                    .map_err(|e| DeliveryError::database(format!("sent flag update failed: {e}")))?;
                self.storage
                    .mark_completed(job.id, message_id.clone())
                    .await
                    .map_err(|e| DeliveryError::database(format!("job completion failed: {e}")))?;

                info!(
                    job_id = %job.id,
                    notification_id = %notification.id,
                    success_count = outcome.success_count,
                    failure_count = outcome.failure_count,
                    "push delivered"
                );

                Ok(DispatchOutcome::Completed {
                    message_id,
                    success_count: outcome.success_count,
                    failure_count: outcome.failure_count,
                })
            },
            Err(error) => self.handle_failure(job, &error).await,
        }
    }

    /// Builds the push message for a notification.
    ///
    /// Metadata flows through as the data payload with the reserved
    /// notification ID key written last.
    fn build_message(
        notification: &Notification,
        device_tokens: &[pushline_core::models::DeviceToken],
    ) -> PushMessage {
        let mut data: HashMap<String, String> = notification.metadata().clone();
        data.insert(NOTIFICATION_ID_KEY.to_string(), notification.id.to_string());

        PushMessage {
            tokens: device_tokens.iter().map(|t| t.token.clone()).collect(),
            title: notification.title.clone(),
            body: notification.body.clone(),
            data,
        }
    }

    /// Routes a failed attempt to retry, dead-letter, or terminal failure.
    async fn handle_failure(
        &self,
        job: &DeliveryJob,
        error: &DeliveryError,
    ) -> Result<DispatchOutcome> {
        if !error.is_retryable() {
            let reason = error.to_string();
            self.fail_terminal(job, &reason).await?;
            error!(
                job_id = %job.id,
                error = %error,
                category = %ErrorCategory::from(error),
                "non-retryable delivery failure"
            );
            return Ok(DispatchOutcome::Failed { reason });
        }

        match self.retry_policy.decide(job.retries) {
            RetryDecision::Requeue { retries } => {
                self.storage
                    .requeue(job.id, retries, error.to_string())
                    .await
                    .map_err(|e| DeliveryError::database(format!("requeue failed: {e}")))?;
                warn!(
                    job_id = %job.id,
                    retries,
                    error = %error,
                    category = %ErrorCategory::from(error),
                    "delivery failed, job requeued"
                );
                Ok(DispatchOutcome::Requeued { retries })
            },
            RetryDecision::DeadLetter { retries } => {
                self.storage
                    .mark_dead_letter(job.id, retries, error.to_string())
                    .await
                    .map_err(|e| DeliveryError::database(format!("dead-letter failed: {e}")))?;
                error!(
                    job_id = %job.id,
                    retries,
                    error = %error,
                    category = %ErrorCategory::from(error),
                    "retries exhausted, job dead-lettered"
                );
                Ok(DispatchOutcome::DeadLettered { retries })
            },
        }
    }

    async fn fail_terminal(&self, job: &DeliveryJob, reason: &str) -> Result<()> {
        self.storage
            .mark_failed(job.id, reason.to_string())
            .await
            .map_err(|e| DeliveryError::database(format!("terminal failure update failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use pushline_core::models::{
        DeliveryJob, JobId, JobStatus, Notification, NotificationId, Platform, UserId,
    };

    use super::*;
    use crate::{
        gateway::mock::MockPushGateway,
        storage::mock::MockDeliveryStorage,
        tokens::mock::StaticTokenResolver,
    };

    struct Harness {
        storage: Arc<MockDeliveryStorage>,
        tokens: Arc<StaticTokenResolver>,
        gateway: Arc<MockPushGateway>,
        dispatcher: Dispatcher,
    }

    fn harness(policy: RetryPolicy) -> Harness {
        let storage = Arc::new(MockDeliveryStorage::new());
        let tokens = Arc::new(StaticTokenResolver::new());
        let gateway = Arc::new(MockPushGateway::new());
        let dispatcher =
            Dispatcher::new(storage.clone(), tokens.clone(), gateway.clone(), policy);
        Harness { storage, tokens, gateway, dispatcher }
    }

    async fn seed_claimed_job(
        h: &Harness,
        metadata: HashMap<String, String>,
        retries: i32,
    ) -> (Notification, DeliveryJob) {
        let now = Utc::now();
        let notification = Notification::new(
            NotificationId::new(),
            UserId::new(),
            "title".into(),
            "body".into(),
            metadata,
            now,
        );
        let mut job = DeliveryJob::new(JobId::new(), notification.id, now);
        job.retries = retries;
        h.storage.add_pending(notification.clone(), job).await;

        let claimed = h
            .storage
            .claim_pending_jobs(1)
            .await
            .unwrap()
            .into_iter()
            .next()
            .expect("job should be claimable");
        (notification, claimed)
    }

    #[tokio::test]
    async fn successful_delivery_completes_job_and_marks_sent() {
        let h = harness(RetryPolicy::default());
        let (notification, job) = seed_claimed_job(&h, HashMap::new(), 0).await;
        h.tokens.register(notification.user_id, "tok-1", Platform::Android).await;

        let outcome = h.dispatcher.dispatch(&job).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Completed { success_count: 1, .. }));
        assert!(h.storage.verify_job_status(job.id, JobStatus::Completed).await);
        assert!(h.storage.notification(notification.id).await.unwrap().sent);

        let stored = h.storage.job(job.id).await.unwrap();
        assert_eq!(stored.message_id.as_deref(), Some("mock-msg-0"));
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn completion_write_failure_never_loses_the_sent_flag() {
        let h = harness(RetryPolicy::default());
        let (notification, job) = seed_claimed_job(&h, HashMap::new(), 0).await;
        h.tokens.register(notification.user_id, "tok-1", Platform::Android).await;
        h.storage.inject_completed_error("connection lost".to_string()).await;

        let result = h.dispatcher.dispatch(&job).await;

        assert!(matches!(result, Err(DeliveryError::Database { .. })));
        // The sent flag is already committed; the job stays claimed and is
        // retried once the stale sweep releases it, at worst repeating the
        // push.
        assert!(h.storage.notification(notification.id).await.unwrap().sent);
        assert!(h.storage.verify_job_status(job.id, JobStatus::Processing).await);
    }

    #[tokio::test]
    async fn partial_success_still_completes() {
        let h = harness(RetryPolicy::default());
        let (notification, job) = seed_claimed_job(&h, HashMap::new(), 0).await;
        h.tokens.register(notification.user_id, "tok-1", Platform::Ios).await;
        h.tokens.register(notification.user_id, "tok-2", Platform::Android).await;

        h.gateway
            .enqueue(Ok(crate::gateway::MulticastOutcome {
                success_count: 1,
                failure_count: 1,
                results: vec![
                    crate::gateway::TokenOutcome {
                        token: "tok-1".into(),
                        success: false,
                        message_id: None,
                        error_code: Some("NotRegistered".into()),
                    },
                    crate::gateway::TokenOutcome {
                        token: "tok-2".into(),
                        success: true,
                        message_id: Some("m2".into()),
                        error_code: None,
                    },
                ],
            }))
            .await;

        let outcome = h.dispatcher.dispatch(&job).await.unwrap();

        match outcome {
            DispatchOutcome::Completed { message_id, success_count, failure_count } => {
                assert_eq!(message_id, "m2");
                assert_eq!(success_count, 1);
                assert_eq!(failure_count, 1);
            },
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(h.storage.verify_job_status(job.id, JobStatus::Completed).await);
    }

    #[tokio::test]
    async fn zero_tokens_fails_terminally_without_gateway_call() {
        let h = harness(RetryPolicy::default());
        let (notification, job) = seed_claimed_job(&h, HashMap::new(), 0).await;

        let outcome = h.dispatcher.dispatch(&job).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
        assert_eq!(h.gateway.call_count().await, 0);
        assert!(h.storage.verify_job_status(job.id, JobStatus::Failed).await);
        assert!(!h.storage.notification(notification.id).await.unwrap().sent);

        let stored = h.storage.job(job.id).await.unwrap();
        assert_eq!(stored.retries, 0);
        assert!(stored.last_error.unwrap().contains("no device tokens"));
    }

    #[tokio::test]
    async fn all_tokens_rejected_requeues_with_advanced_counter() {
        let h = harness(RetryPolicy::default());
        let (notification, job) = seed_claimed_job(&h, HashMap::new(), 0).await;
        h.tokens.register(notification.user_id, "tok-1", Platform::Web).await;
        h.gateway.enqueue_all_failed("NotRegistered").await;

        let outcome = h.dispatcher.dispatch(&job).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Requeued { retries: 1 });
        assert!(h.storage.verify_job_status(job.id, JobStatus::Pending).await);
        assert!(!h.storage.notification(notification.id).await.unwrap().sent);
    }

    #[tokio::test]
    async fn transport_error_requeues() {
        let h = harness(RetryPolicy::default());
        let (notification, job) = seed_claimed_job(&h, HashMap::new(), 2).await;
        h.tokens.register(notification.user_id, "tok-1", Platform::Android).await;
        h.gateway.enqueue_error(DeliveryError::transport("connection reset")).await;

        let outcome = h.dispatcher.dispatch(&job).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Requeued { retries: 3 });
        let stored = h.storage.job(job.id).await.unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("gateway transport failed: connection reset"));
    }

    #[tokio::test]
    async fn final_failure_dead_letters() {
        let h = harness(RetryPolicy::new(5));
        let (notification, job) = seed_claimed_job(&h, HashMap::new(), 4).await;
        h.tokens.register(notification.user_id, "tok-1", Platform::Android).await;
        h.gateway.enqueue_error(DeliveryError::gateway(503, "unavailable")).await;

        let outcome = h.dispatcher.dispatch(&job).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::DeadLettered { retries: 5 });
        assert!(h.storage.verify_job_status(job.id, JobStatus::DeadLetter).await);
    }

    #[tokio::test]
    async fn missing_notification_fails_terminally() {
        let h = harness(RetryPolicy::default());
        let now = Utc::now();
        let orphan = NotificationId::new();
        let job = DeliveryJob::new(JobId::new(), orphan, now);

        // Insert the job without its notification, then claim it.
        h.storage
            .create_notification_with_job(
                Notification::new(
                    NotificationId::new(),
                    UserId::new(),
                    "t".into(),
                    "b".into(),
                    HashMap::new(),
                    now,
                ),
                job.clone(),
            )
            .await
            .unwrap();
        let claimed = h.storage.claim_job(job.id).await.unwrap().unwrap();

        let outcome = h.dispatcher.dispatch(&claimed).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
        assert!(h.storage.verify_job_status(job.id, JobStatus::Failed).await);
        assert_eq!(h.gateway.call_count().await, 0);
    }

    #[tokio::test]
    async fn reserved_metadata_key_is_overwritten() {
        let h = harness(RetryPolicy::default());
        let metadata = HashMap::from([
            ("orderId".to_string(), "ord-42".to_string()),
            (NOTIFICATION_ID_KEY.to_string(), "spoofed".to_string()),
        ]);
        let (notification, job) = seed_claimed_job(&h, metadata, 0).await;
        h.tokens.register(notification.user_id, "tok-1", Platform::Ios).await;

        h.dispatcher.dispatch(&job).await.unwrap();

        let sent = h.gateway.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.get(NOTIFICATION_ID_KEY), Some(&notification.id.to_string()));
        assert_eq!(sent[0].data.get("orderId"), Some(&"ord-42".to_string()));
        assert_eq!(sent[0].title, "title");
        assert_eq!(sent[0].tokens, vec!["tok-1".to_string()]);
    }

    #[tokio::test]
    async fn token_lookup_error_is_retryable() {
        let h = harness(RetryPolicy::default());
        let (_, job) = seed_claimed_job(&h, HashMap::new(), 0).await;
        h.tokens.inject_error("connection lost".to_string()).await;

        let outcome = h.dispatcher.dispatch(&job).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Requeued { retries: 1 });
        assert_eq!(h.gateway.call_count().await, 0);
    }
}
