//! End-to-end delivery pipeline tests against mock collaborators.
//!
//! Runs queued jobs through the engine's batch processing and verifies the
//! full job lifecycle: completion, terminal failure, bounded retries, and
//! the dead-letter queue.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use pushline_core::{
    models::{DeliveryJob, JobId, JobStatus, Notification, NotificationId, Platform, UserId},
    RealClock,
};
use pushline_delivery::{
    engine::DeliveryEngine,
    error::DeliveryError,
    gateway::mock::MockPushGateway,
    retry::RetryPolicy,
    storage::mock::MockDeliveryStorage,
    tokens::mock::StaticTokenResolver,
    DeliveryConfig,
};

struct Pipeline {
    engine: DeliveryEngine,
    storage: Arc<MockDeliveryStorage>,
    tokens: Arc<StaticTokenResolver>,
    gateway: Arc<MockPushGateway>,
}

fn pipeline(config: DeliveryConfig) -> Pipeline {
    let storage = Arc::new(MockDeliveryStorage::new());
    let tokens = Arc::new(StaticTokenResolver::new());
    let gateway = Arc::new(MockPushGateway::new());
    let engine = DeliveryEngine::new(
        storage.clone(),
        tokens.clone(),
        gateway.clone(),
        config,
        Arc::new(RealClock::new()),
    );
    Pipeline { engine, storage, tokens, gateway }
}

async fn seed_job(storage: &MockDeliveryStorage, user: UserId) -> (Notification, DeliveryJob) {
    let now = Utc::now();
    let notification = Notification::new(
        NotificationId::new(),
        user,
        "order shipped".into(),
        "your package is on the way".into(),
        HashMap::from([("orderId".to_string(), "ord-42".to_string())]),
        now,
    );
    let job = DeliveryJob::new(JobId::new(), notification.id, now);
    storage.add_pending(notification.clone(), job.clone()).await;
    (notification, job)
}

#[tokio::test]
async fn queued_job_is_delivered_to_completion() {
    let p = pipeline(DeliveryConfig::default());
    let user = UserId::new();
    let (notification, job) = seed_job(&p.storage, user).await;
    p.tokens.register(user, "device-token-1", Platform::Android).await;

    let processed = p.engine.process_batch().await.unwrap();
    assert_eq!(processed, 1);

    let stored = p.storage.job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.message_id.is_some());
    assert_eq!(stored.retries, 0);
    assert!(p.storage.notification(notification.id).await.unwrap().sent);

    // The push carried the payload and the notification ID.
    let sent = p.gateway.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tokens, vec!["device-token-1".to_string()]);
    assert_eq!(sent[0].data.get("orderId"), Some(&"ord-42".to_string()));
    assert_eq!(sent[0].data.get("notificationId"), Some(&notification.id.to_string()));
}

#[tokio::test]
async fn recipient_without_devices_fails_terminally() {
    let p = pipeline(DeliveryConfig::default());
    let (notification, job) = seed_job(&p.storage, UserId::new()).await;

    assert_eq!(p.engine.process_batch().await.unwrap(), 1);

    let stored = p.storage.job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retries, 0);
    assert!(stored.last_error.unwrap().contains("no device tokens"));
    assert!(!p.storage.notification(notification.id).await.unwrap().sent);
    assert_eq!(p.gateway.call_count().await, 0);

    // Terminal: the job never becomes claimable again.
    assert_eq!(p.engine.process_batch().await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_full_failure_dead_letters_after_max_retries() {
    let max_retries = 5;
    let config = DeliveryConfig {
        retry_policy: RetryPolicy::new(max_retries),
        ..Default::default()
    };
    let p = pipeline(config);
    let user = UserId::new();
    let (notification, job) = seed_job(&p.storage, user).await;
    p.tokens.register(user, "device-token-1", Platform::Ios).await;

    for _ in 0..max_retries {
        p.gateway.enqueue_all_failed("NotRegistered").await;
    }

    // Each batch claims the requeued job and fails it again.
    for attempt in 1..=max_retries {
        assert_eq!(p.engine.process_batch().await.unwrap(), 1, "attempt {attempt}");
    }

    let stored = p.storage.job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::DeadLetter);
    assert_eq!(stored.retries, max_retries);
    assert!(stored.last_error.is_some());
    assert!(!p.storage.notification(notification.id).await.unwrap().sent);

    // Exactly max_retries gateway calls, then nothing left to claim.
    assert_eq!(p.gateway.call_count().await, max_retries as usize);
    assert_eq!(p.engine.process_batch().await.unwrap(), 0);

    let stats = p.engine.stats().await;
    assert_eq!(stats.jobs_processed, max_retries as u64);
    assert_eq!(stats.requeued, (max_retries - 1) as u64);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn job_recovers_when_gateway_comes_back() {
    let p = pipeline(DeliveryConfig::default());
    let user = UserId::new();
    let (_, job) = seed_job(&p.storage, user).await;
    p.tokens.register(user, "device-token-1", Platform::Web).await;

    p.gateway.enqueue_error(DeliveryError::transport("connection refused")).await;
    p.gateway.enqueue_error(DeliveryError::gateway(503, "unavailable")).await;

    assert_eq!(p.engine.process_batch().await.unwrap(), 1);
    assert_eq!(p.storage.job(job.id).await.unwrap().retries, 1);
    assert_eq!(p.engine.process_batch().await.unwrap(), 1);
    assert_eq!(p.storage.job(job.id).await.unwrap().retries, 2);

    // Third attempt hits an unscripted (healthy) gateway.
    assert_eq!(p.engine.process_batch().await.unwrap(), 1);

    let stored = p.storage.job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.retries, 2);
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn partial_fanout_success_completes_the_job() {
    let p = pipeline(DeliveryConfig::default());
    let user = UserId::new();
    let (notification, job) = seed_job(&p.storage, user).await;
    p.tokens.register(user, "stale-token", Platform::Android).await;
    p.tokens.register(user, "live-token", Platform::Android).await;

    p.gateway
        .enqueue(Ok(pushline_delivery::gateway::MulticastOutcome {
            success_count: 1,
            failure_count: 1,
            results: vec![
                pushline_delivery::gateway::TokenOutcome {
                    token: "stale-token".into(),
                    success: false,
                    message_id: None,
                    error_code: Some("NotRegistered".into()),
                },
                pushline_delivery::gateway::TokenOutcome {
                    token: "live-token".into(),
                    success: true,
                    message_id: Some("msg-live".into()),
                    error_code: None,
                },
            ],
        }))
        .await;

    assert_eq!(p.engine.process_batch().await.unwrap(), 1);

    let stored = p.storage.job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.message_id.as_deref(), Some("msg-live"));
    assert_eq!(stored.retries, 0);
    assert!(p.storage.notification(notification.id).await.unwrap().sent);
}

#[tokio::test]
async fn batch_limit_bounds_each_poll() {
    let config = DeliveryConfig { batch_limit: 2, ..Default::default() };
    let p = pipeline(config);
    let user = UserId::new();
    p.tokens.register(user, "device-token-1", Platform::Android).await;

    for _ in 0..5 {
        seed_job(&p.storage, user).await;
    }

    assert_eq!(p.engine.process_batch().await.unwrap(), 2);
    assert_eq!(p.engine.process_batch().await.unwrap(), 2);
    assert_eq!(p.engine.process_batch().await.unwrap(), 1);
    assert_eq!(p.engine.process_batch().await.unwrap(), 0);

    let stats = p.engine.stats().await;
    assert_eq!(stats.completed, 5);
}

#[tokio::test]
async fn claim_failure_does_not_poison_the_worker() {
    let p = pipeline(DeliveryConfig::default());
    let user = UserId::new();
    let (_, job) = seed_job(&p.storage, user).await;
    p.tokens.register(user, "device-token-1", Platform::Android).await;

    p.storage.inject_claim_error("connection reset by peer".to_string()).await;

    assert!(p.engine.process_batch().await.is_err());

    // Next poll claims and delivers normally.
    assert_eq!(p.engine.process_batch().await.unwrap(), 1);
    assert_eq!(p.storage.job(job.id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn background_engine_drains_the_queue() {
    let config = DeliveryConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let p = pipeline(config);
    let user = UserId::new();
    p.tokens.register(user, "device-token-1", Platform::Android).await;

    let mut jobs = Vec::new();
    for _ in 0..4 {
        let (_, job) = seed_job(&p.storage, user).await;
        jobs.push(job.id);
    }

    let mut engine = p.engine;
    engine.start().await.unwrap();

    let all_done = |storage: Arc<MockDeliveryStorage>, jobs: Vec<JobId>| async move {
        for id in &jobs {
            if !storage.verify_job_status(*id, JobStatus::Completed).await {
                return false;
            }
        }
        true
    };

    for _ in 0..200 {
        if all_done(p.storage.clone(), jobs.clone()).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(all_done(p.storage.clone(), jobs.clone()).await);
    engine.shutdown().await.unwrap();
}
