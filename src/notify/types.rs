//! Notification row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted notification.
///
/// Append-only apart from `delivered_at`, which is set exactly once by
/// `NotificationStore::mark_delivered` after confirmed delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    /// Recipient.
    pub mentioned_agent_id: String,
    /// Sender. Never equal to the recipient in rows produced by the fan-out
    /// engine; the store itself does not enforce this.
    pub from_agent_id: String,
    /// Denormalized copy of the triggering message text, `@mention` markup
    /// included.
    pub content: String,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// Input for creating a notification row.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub mentioned_agent_id: String,
    pub from_agent_id: String,
    pub content: String,
    pub task_id: Option<String>,
}
