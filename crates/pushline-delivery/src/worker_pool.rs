//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for supervised
//! delivery worker tasks.

use std::{sync::Arc, time::Duration};

use pushline_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatch::Dispatcher,
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
};

/// Worker pool that manages delivery worker tasks with supervision.
///
/// Ensures proper lifecycle management and graceful shutdown for the
/// polling workers. All workers share one cancellation token and are
/// collectively joined on shutdown.
pub struct WorkerPool {
    storage: Arc<dyn DeliveryStorage>,
    dispatcher: Dispatcher,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Create a new worker pool with the given configuration.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        dispatcher: Dispatcher,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            config,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawn all configured workers and begin processing.
    ///
    /// Workers will run until cancellation is requested via the cancellation
    /// token. Returns immediately after spawning all workers.
    ///
    /// # Errors
    ///
    /// Currently never returns error but signature allows for future
    /// validation.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.storage.clone(),
                self.dispatcher.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(
                        worker_id,
                        error = %error,
                        "delivery worker terminated with error"
                    );
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(
            spawned_workers = self.worker_handles.len(),
            "all delivery workers spawned successfully"
        );

        Ok(())
    }

    /// Gracefully shutdown all workers, waiting for in-flight deliveries to
    /// complete.
    ///
    /// Signals cancellation to all workers and waits for them to finish their
    /// current work within the timeout.
    ///
    /// # Errors
    ///
    /// Returns error if shutdown timeout is exceeded or workers fail to join.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let shutdown_future = async {
            let mut results = Vec::new();

            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                match handle.await {
                    Ok(worker_result) => {
                        if let Err(error) = worker_result {
                            warn!(
                                worker_id,
                                error = %error,
                                "worker completed with error during shutdown"
                            );
                        }
                        results.push(Ok(()));
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        results.push(Err(DeliveryError::WorkerPanic {
                            worker_id,
                            error: format!("{join_error}"),
                        }));
                    },
                }
            }

            {
                let mut stats = self.stats.write().await;
                stats.active_workers = 0;
            }

            results
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(results) => {
                let error_count = results.iter().filter(|r| r.is_err()).count();
                if error_count > 0 {
                    warn!(
                        error_count,
                        total_workers = results.len(),
                        "some workers completed with errors during shutdown"
                    );
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.worker_handles.is_empty() {
            let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

            if active_count > 0 && !self.cancellation_token.is_cancelled() {
                error!(
                    active_workers = active_count,
                    "WorkerPool dropped with active workers, forcing cancellation to prevent orphaned tasks"
                );

                self.cancellation_token.cancel();

                warn!(
                    "WorkerPool was not shut down gracefully. Call shutdown_graceful() before dropping to ensure clean shutdown."
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pushline_core::RealClock;

    use super::*;
    use crate::{
        gateway::mock::MockPushGateway, retry::RetryPolicy, storage::mock::MockDeliveryStorage,
        tokens::mock::StaticTokenResolver,
    };

    fn create_test_worker_pool(config: DeliveryConfig) -> (WorkerPool, Arc<RwLock<EngineStats>>) {
        let storage: Arc<dyn DeliveryStorage> = Arc::new(MockDeliveryStorage::new());
        let dispatcher = Dispatcher::new(
            storage.clone(),
            Arc::new(StaticTokenResolver::new()),
            Arc::new(MockPushGateway::new()),
            RetryPolicy::default(),
        );
        let stats = Arc::new(RwLock::new(EngineStats::default()));

        let pool = WorkerPool::new(
            storage,
            dispatcher,
            config,
            stats.clone(),
            CancellationToken::new(),
            Arc::new(RealClock::new()),
        );
        (pool, stats)
    }

    #[tokio::test]
    async fn worker_pool_spawns_configured_number_of_workers() {
        let config = DeliveryConfig {
            worker_count: 5,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (mut pool, stats) = create_test_worker_pool(config);

        pool.spawn_workers().await.expect("workers should spawn successfully");
        assert_eq!(pool.worker_handles.len(), 5);
        assert_eq!(stats.read().await.active_workers, 5);

        pool.shutdown_graceful(Duration::from_secs(1))
            .await
            .expect("graceful shutdown should succeed");
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn worker_pool_shuts_down_gracefully_within_timeout() {
        let config = DeliveryConfig {
            worker_count: 2,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (mut pool, _stats) = create_test_worker_pool(config);
        pool.spawn_workers().await.expect("workers should spawn successfully");

        // Small delay to ensure workers are running
        tokio::time::sleep(Duration::from_millis(10)).await;

        let shutdown_start = std::time::Instant::now();
        pool.shutdown_graceful(Duration::from_secs(3))
            .await
            .expect("graceful shutdown should complete within timeout");

        // Shutdown should complete quickly since no work is being done
        assert!(shutdown_start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn empty_pool_shuts_down_immediately() {
        let (pool, _stats) = create_test_worker_pool(DeliveryConfig::default());

        assert!(!pool.has_active_workers());
        let result = pool.shutdown_graceful(Duration::from_millis(1)).await;
        assert!(result.is_ok());
    }
}
