//! Repository for device token registrations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeviceToken, Platform, UserId},
};

/// Repository for device token database operations.
///
/// A user may hold any number of tokens across platforms. Registration is an
/// upsert keyed on (user_id, token) so app re-installs do not accumulate
/// duplicates.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Registers a push token for a user.
    ///
    /// Re-registering an existing (user, token) pair refreshes the platform
    /// instead of inserting a duplicate row.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn register(
        &self,
        user_id: UserId,
        token: &str,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO device_tokens (id, user_id, token, platform, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, token)
            DO UPDATE SET platform = EXCLUDED.platform
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id.0)
        .bind(token)
        .bind(platform.to_string())
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Removes a push token for a user.
    ///
    /// Removing a token that was never registered is not an error; token
    /// cleanup from clients is best-effort.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn remove(&self, user_id: UserId, token: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM device_tokens
            WHERE user_id = $1 AND token = $2
            "#,
        )
        .bind(user_id.0)
        .bind(token)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Returns a user's token registrations.
    ///
    /// Ordering is stable (registration order) so fan-out batches are
    /// reproducible.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        let tokens = sqlx::query_as::<_, DeviceToken>(
            r#"
            SELECT id, user_id, token, platform, created_at
            FROM device_tokens
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&*self.pool)
        .await?;

        Ok(tokens)
    }
}
