//! NotificationStore: durable notification rows and the delivered flag.

use crate::error::Result;
use crate::notify::types::{NewNotification, Notification};

use anyhow::Context as _;
use chrono::Utc;
use sqlx::SqlitePool;

/// Persistent store for notifications, backed by the instance SQLite database.
///
/// Shared between the request path (fan-out inserts) and the delivery daemon
/// (undelivered polls and delivered marks).
#[derive(Clone)]
pub struct NotificationStore {
    pool: SqlitePool,
}

impl NotificationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a single undelivered notification. Duplicate content is not an
    /// error; recipient dedup is the fan-out engine's job.
    pub async fn create(&self, new: &NewNotification) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO notifications (id, mentioned_agent_id, from_agent_id, content, task_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.mentioned_agent_id)
        .bind(&new.from_agent_id)
        .bind(&new.content)
        .bind(&new.task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to insert notification")?;

        Ok(id)
    }

    /// Insert a batch of notifications. Returned ids preserve input order.
    pub async fn create_bulk(&self, batch: &[NewNotification]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(batch.len());
        for new in batch {
            ids.push(self.create(new).await?);
        }
        Ok(ids)
    }

    /// All undelivered notifications for an agent, oldest first. The
    /// secondary id ordering keeps polling stable when rows share a
    /// timestamp.
    pub async fn get_undelivered(&self, agent_id: &str) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, mentioned_agent_id, from_agent_id, content, task_id, created_at, delivered_at
             FROM notifications
             WHERE mentioned_agent_id = ? AND delivered_at IS NULL
             ORDER BY created_at ASC, id ASC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch undelivered notifications")?;

        Ok(rows.into_iter().map(NotificationRow::into_notification).collect())
    }

    /// Mark a notification delivered. Idempotent: the guarded UPDATE makes a
    /// second call a no-op, and the flag can never revert.
    pub async fn mark_delivered(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE notifications
             SET delivered_at = ?
             WHERE id = ? AND delivered_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark notification delivered")?;

        Ok(())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: String,
    mentioned_agent_id: String,
    from_agent_id: String,
    content: String,
    task_id: Option<String>,
    created_at: chrono::DateTime<Utc>,
    delivered_at: Option<chrono::DateTime<Utc>>,
}

impl NotificationRow {
    fn into_notification(self) -> Notification {
        Notification {
            id: self.id,
            mentioned_agent_id: self.mentioned_agent_id,
            from_agent_id: self.from_agent_id,
            content: self.content,
            task_id: self.task_id,
            created_at: self.created_at,
            delivered_at: self.delivered_at,
        }
    }
}
