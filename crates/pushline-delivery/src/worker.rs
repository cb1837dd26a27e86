//! Polling workers for queued push delivery.
//!
//! Workers claim jobs from PostgreSQL using SKIP LOCKED for lock-free
//! distribution and run each claimed job through the dispatch pipeline.
//! An idle worker sleeps for the poll interval; a failing one backs off
//! briefly before retrying so storage outages do not become busy loops.

use std::{sync::Arc, time::Duration};

use pushline_core::{models::DeliveryJob, Clock};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    dispatch::{DispatchOutcome, Dispatcher},
    error::{DeliveryError, Result},
    retry::RetryPolicy,
    storage::DeliveryStorage,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum jobs to claim per worker poll.
    pub batch_limit: usize,

    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,

    /// Retry policy applied to failed delivery attempts.
    pub retry_policy: RetryPolicy,

    /// Shutdown timeout - maximum time to wait for workers to complete.
    pub shutdown_timeout: Duration,

    /// Age after which a job stuck in processing is returned to the queue.
    ///
    /// Should comfortably exceed the gateway timeout so the sweep never
    /// steals a job from a worker that is merely slow.
    pub stale_after: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_limit: crate::DEFAULT_BATCH_LIMIT,
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(50),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Total jobs processed since startup.
    pub jobs_processed: u64,
    /// Jobs that completed with at least one accepted token.
    pub completed: u64,
    /// Failed attempts returned to the queue.
    pub requeued: u64,
    /// Jobs moved to the dead-letter queue.
    pub dead_lettered: u64,
    /// Jobs failed terminally without a delivery attempt.
    pub failed_terminal: u64,
    /// Jobs currently being delivered.
    pub in_flight: u64,
}

/// Individual worker that polls for and delivers queued jobs.
pub struct DeliveryWorker {
    id: usize,
    storage: Arc<dyn DeliveryStorage>,
    dispatcher: Dispatcher,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    pub fn new(
        id: usize,
        storage: Arc<dyn DeliveryStorage>,
        dispatcher: Dispatcher,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, dispatcher, config, stats, cancellation_token, clock }
    }

    /// Main worker loop - claims and delivers jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error only if worker setup fails. Batch processing errors are
    /// logged and retried.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            // Early cancellation check prevents unnecessary work if shutdown signaled
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(processed_count) => {
                    if processed_count == 0 {
                        tokio::select! {
                            () = self.clock.sleep(self.config.poll_interval) => {
                                // No jobs available, wait before polling again
                            }
                            () = self.cancellation_token.cancelled() => break,
                        }
                    }
                },
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker batch processing failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {
                            // Wait before retrying to avoid tight error loops
                        }
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims and delivers one batch of pending jobs.
    ///
    /// Returns the number of jobs actually dispatched. Jobs claimed but
    /// skipped because shutdown was signaled mid-batch are not counted;
    /// they stay claimed until the stale sweep releases them. Per-job
    /// dispatch errors are logged and do not stop the batch.
    ///
    /// # Errors
    ///
    /// Returns error if claiming jobs from storage fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self.claim_pending_jobs().await?;

        debug!(worker_id = self.id, batch_size = jobs.len(), "processing job batch");

        let mut dispatched = 0;
        for job in jobs {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Err(error) = self.process_job(job).await {
                error!(
                    worker_id = self.id,
                    error = %error,
                    "job processing failed"
                );
            }
            dispatched += 1;
        }

        Ok(dispatched)
    }

    async fn claim_pending_jobs(&self) -> Result<Vec<DeliveryJob>> {
        let jobs = self
            .storage
            .claim_pending_jobs(self.config.batch_limit)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim pending jobs: {e}")))?;

        debug!(
            worker_id = self.id,
            claimed_count = jobs.len(),
            "claimed delivery jobs for processing"
        );

        Ok(jobs)
    }

    /// Delivers a single claimed job and records the outcome in the stats.
    ///
    /// # Errors
    ///
    /// Returns error if the dispatch pipeline cannot persist the job's
    /// state transition.
    async fn process_job(&self, job: DeliveryJob) -> Result<()> {
        {
            let mut stats = self.stats.write().await;
            stats.in_flight += 1;
        }

        let result = self.dispatcher.dispatch(&job).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            stats.jobs_processed += 1;

            if let Ok(outcome) = &result {
                match outcome {
                    DispatchOutcome::Completed { .. } => stats.completed += 1,
                    DispatchOutcome::Requeued { .. } => stats.requeued += 1,
                    DispatchOutcome::DeadLettered { .. } => stats.dead_lettered += 1,
                    DispatchOutcome::Failed { .. } => stats.failed_terminal += 1,
                }
            }
        }

        result.map(|_| ())
    }
}
