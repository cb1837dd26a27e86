//! Database access layer implementing the repository pattern for
//! notification persistence.
//!
//! The repository layer acts as an anti-corruption layer, translating between
//! domain models and database schemas. This isolation allows schema evolution
//! without breaking domain logic.
//!
//! All database operations MUST go through these repositories. Direct SQL
//! queries outside this module are forbidden to maintain consistency.

use std::sync::Arc;

use sqlx::PgPool;

pub mod device_tokens;
pub mod jobs;
pub mod notifications;

use crate::{
    error::Result,
    models::{DeliveryJob, Notification},
};

/// Container for all repository instances providing unified database access.
///
/// The `Storage` struct is the entry point for all database operations in
/// pushline. It manages a shared connection pool and provides type-safe
/// access to each domain repository.
#[derive(Clone)]
pub struct Storage {
    /// Repository for notification records.
    pub notifications: Arc<notifications::Repository>,

    /// Repository for delivery job state.
    pub jobs: Arc<jobs::Repository>,

    /// Repository for device token registrations.
    pub device_tokens: Arc<device_tokens::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool with Arc for efficient resource
    /// usage.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            notifications: Arc::new(notifications::Repository::new(pool.clone())),
            jobs: Arc::new(jobs::Repository::new(pool.clone())),
            device_tokens: Arc::new(device_tokens::Repository::new(pool)),
        }
    }

    /// Creates a notification and its pending delivery job atomically.
    ///
    /// Either both rows exist afterwards or neither does. This is the only
    /// sanctioned way to enqueue background delivery; a notification without
    /// a job would never be picked up by the worker.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the transaction fails.
    pub async fn create_notification_with_job(
        &self,
        notification: &Notification,
        job: &DeliveryJob,
    ) -> Result<()> {
        let mut tx = self.notifications.pool().begin().await?;

        self.notifications.create_in_tx(&mut tx, notification).await?;
        self.jobs.create_in_tx(&mut tx, job).await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        // Verifies the Storage struct can be instantiated; actual database
        // behavior is covered by integration tests.
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
