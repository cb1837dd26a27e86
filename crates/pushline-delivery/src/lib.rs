//! Push notification delivery engine with reliability guarantees.
//!
//! This crate implements the delivery system that processes notification
//! jobs from the database and fans them out to a push gateway, with bounded
//! retries and a dead-letter queue for jobs that keep failing.
//!
//! # Architecture
//!
//! Workers claim jobs from PostgreSQL using `FOR UPDATE SKIP LOCKED` for
//! lock-free work distribution. Each worker handles the complete delivery
//! lifecycle:
//!
//! 1. **Claim Jobs** - Worker claims pending jobs from the database
//! 2. **Resolve Tokens** - Look up the recipient's registered device tokens
//! 3. **Multicast Send** - One gateway call covering every token
//! 4. **Status Update** - Complete, requeue, or dead-letter the job
//!
//! A job completes as soon as at least one device accepts the push; a full
//! failure advances the retry counter and requeues the job until the
//! configured maximum, after which it lands in the dead-letter queue.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pushline_core::RealClock;
//! use pushline_delivery::{
//!     gateway::{GatewayConfig, HttpPushGateway},
//!     DeliveryConfig, DeliveryEngine, DeliveryError,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let gateway = Arc::new(HttpPushGateway::new(GatewayConfig::default())?);
//! let mut engine = DeliveryEngine::from_pool(
//!     &pool,
//!     gateway,
//!     DeliveryConfig::default(),
//!     Arc::new(RealClock::new()),
//! );
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod retry;
pub mod service;
pub mod storage;
pub mod tokens;
mod worker;
mod worker_pool;

// Re-export main public API
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use engine::DeliveryEngine;
pub use error::{DeliveryError, Result};
pub use service::{NotificationService, SendReport};
pub use worker::{DeliveryConfig, EngineStats};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default maximum jobs to claim per poll.
pub const DEFAULT_BATCH_LIMIT: usize = 10;

/// Default poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// Default number of full delivery failures before a job is dead-lettered.
pub const DEFAULT_MAX_RETRIES: i32 = 5;
