//! Repository for notification database operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{Notification, NotificationId, UserId},
};

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, title, body, metadata, sent, read, deleted, created_at, updated_at";

/// Repository for notification database operations.
///
/// Handles persistence of notification records. Delivery state lives on the
/// jobs table; the mutable fields here are the `sent`, `read`, and `deleted`
/// flags.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates a notification within a transaction.
    ///
    /// Notifications are only ever created together with their delivery job,
    /// so there is no standalone insert path.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        notification: &Notification,
    ) -> Result<NotificationId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO notifications (
                id, user_id, title, body, metadata, sent, read, deleted,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            )
            RETURNING id
            "#,
        )
        .bind(notification.id.0)
        .bind(notification.user_id.0)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&notification.metadata)
        .bind(notification.sent)
        .bind(notification.read)
        .bind(notification.deleted)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(NotificationId(id))
    }

    /// Finds a notification by ID.
    ///
    /// Soft-deleted notifications are still returned here; callers serving
    /// user-facing listings should use `find_by_user` instead.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: NotificationId) -> Result<Option<Notification>> {
        let notification = sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE id = $1
            "#,
        ))
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(notification)
    }

    /// Finds notifications for a user, newest first.
    ///
    /// Excludes soft-deleted rows. When `since` is given, only notifications
    /// created after that instant are returned.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_user(
        &self,
        user_id: UserId,
        limit: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Notification>> {
        let notifications = sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE user_id = $1
              AND deleted = FALSE
              AND ($3::timestamptz IS NULL OR created_at > $3)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        ))
        .bind(user_id.0)
        .bind(limit.unwrap_or(100))
        .bind(since)
        .fetch_all(&*self.pool)
        .await?;

        Ok(notifications)
    }

    /// Marks a notification as sent.
    ///
    /// Flips the flag exactly once, when the delivery job completes. The
    /// guard on `sent = FALSE` keeps the transition one-way.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_sent(&self, id: NotificationId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET sent = TRUE, updated_at = NOW()
            WHERE id = $1 AND sent = FALSE
            "#,
        )
        .bind(id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a user's notifications as read.
    ///
    /// Scoped to the user so one user cannot mark another's rows. IDs that
    /// do not belong to the user are silently skipped. Returns the number of
    /// rows updated.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_read(&self, user_id: UserId, ids: &[NotificationId]) -> Result<u64> {
        let raw_ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();

        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET read = TRUE, updated_at = NOW()
            WHERE user_id = $1 AND id = ANY($2) AND deleted = FALSE
            "#,
        )
        .bind(user_id.0)
        .bind(&raw_ids)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Soft-deletes a user's notification.
    ///
    /// The row is retained for the audit trail but disappears from
    /// user-facing listings.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the notification does not exist for
    /// this user or was already deleted.
    pub async fn soft_delete(&self, user_id: UserId, id: NotificationId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET deleted = TRUE, updated_at = NOW()
            WHERE user_id = $1 AND id = $2 AND deleted = FALSE
            "#,
        )
        .bind(user_id.0)
        .bind(id.0)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("notification {id}")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
