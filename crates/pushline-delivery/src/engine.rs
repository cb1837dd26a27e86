//! Delivery engine coordinating workers and the stale-job sweep.
//!
//! The engine owns the worker pool and a background sweep task that
//! returns jobs stranded in processing by a crashed worker. All
//! collaborators are constructor-injected so tests can run the full
//! pipeline against mocks.

use std::sync::Arc;

use pushline_core::{storage::Storage, Clock};
use sqlx::PgPool;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatch::Dispatcher,
    error::Result,
    gateway::PushGateway,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    tokens::{StorageTokenResolver, TokenResolver},
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
    worker_pool::WorkerPool,
};

/// Main delivery engine coordinating push delivery workers.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    dispatcher: Dispatcher,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    sweep_handle: Option<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates a new delivery engine with injected collaborators.
    ///
    /// This constructor allows dependency injection of the storage, token
    /// resolver, and gateway, enabling isolated testing without a database
    /// or network.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        tokens: Arc<dyn TokenResolver>,
        gateway: Arc<dyn PushGateway>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher =
            Dispatcher::new(storage.clone(), tokens, gateway, config.retry_policy);

        Self {
            storage,
            dispatcher,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            sweep_handle: None,
            clock,
        }
    }

    /// Creates a production engine over a PostgreSQL pool.
    ///
    /// Wires the PostgreSQL storage adapter and the storage-backed token
    /// resolver around the given gateway.
    pub fn from_pool(
        pool: &PgPool,
        gateway: Arc<dyn PushGateway>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let concrete = Arc::new(Storage::new(pool.clone()));
        let storage: Arc<dyn DeliveryStorage> =
            Arc::new(PostgresDeliveryStorage::new(concrete.clone()));
        let tokens: Arc<dyn TokenResolver> = Arc::new(StorageTokenResolver::new(concrete));

        Self::new(storage, tokens, gateway, config, clock)
    }

    /// Starts the delivery engine with the configured worker pool.
    ///
    /// Returns immediately after spawning workers and the stale-job sweep.
    /// Use `shutdown()` to stop gracefully, or drop the engine to cancel
    /// workers immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_limit = self.config.batch_limit,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting push delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);
        self.sweep_handle = Some(self.spawn_stale_sweep());

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Spawns the background task that releases stranded jobs.
    ///
    /// A job stuck in processing longer than `stale_after` is returned to
    /// pending without advancing its retry counter; the crash was not a
    /// delivery failure.
    fn spawn_stale_sweep(&self) -> JoinHandle<()> {
        let storage = self.storage.clone();
        let clock = self.clock.clone();
        let cancellation_token = self.cancellation_token.clone();
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let sweep_interval = self.config.stale_after;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = clock.sleep(sweep_interval) => {}
                    () = cancellation_token.cancelled() => break,
                }

                let cutoff = clock.now_utc() - stale_after;
                match storage.release_stale(cutoff).await {
                    Ok(0) => {},
                    Ok(released) => {
                        warn!(released, "released jobs stranded in processing");
                    },
                    Err(e) => {
                        error!(error = %e, "stale job sweep failed");
                    },
                }
            }
        })
    }

    /// Gracefully shuts down the delivery engine.
    ///
    /// Signals all workers to stop claiming new jobs and waits for in-flight
    /// deliveries to complete within the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns error if graceful shutdown fails or times out.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        self.cancellation_token.cancel();

        if let Some(handle) = self.sweep_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "stale sweep task did not shut down cleanly");
            }
        }

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Processes exactly one batch of pending jobs synchronously.
    ///
    /// Designed for testing and controlled batch processing: claims one
    /// batch, delivers it, and returns the number of jobs dispatched without
    /// starting persistent workers.
    ///
    /// # Errors
    ///
    /// Returns error if claiming jobs fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = DeliveryWorker::new(
            0,
            self.storage.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker.process_batch().await
    }
}
