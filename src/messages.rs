//! Message posting: the collaboration-side trigger for notification fan-out.

use crate::error::Result;
use crate::notify::fanout;
use crate::notify::store::NotificationStore;
use crate::tasks::store::TaskStore;
use crate::tasks::types::ActivityKind;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// Input for posting a message on a task.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub task_id: String,
    pub from_agent_id: String,
    pub content: String,
    pub mentions: Vec<String>,
    /// Opaque document references; this core only stores them.
    pub attachment_ids: Vec<String>,
}

/// A persisted message.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub task_id: String,
    pub from_agent_id: String,
    pub content: String,
    pub mentions: Vec<String>,
    pub attachment_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of a post: the stored message id plus the recipients the fan-out
/// engine recorded notifications for.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub message_id: String,
    pub notified: Vec<String>,
}

/// Store for task messages. Posting a message auto-subscribes the poster and
/// fans notifications out to mentions and subscribers.
#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
    tasks: TaskStore,
    notifications: NotificationStore,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            tasks: TaskStore::new(pool.clone()),
            notifications: NotificationStore::new(pool.clone()),
            pool,
        }
    }

    /// Post a message on a task.
    ///
    /// Side effects, in order: the message row is inserted, the poster is
    /// subscribed to the task (when it exists), exactly one `message_sent`
    /// activity is recorded, and the fan-out engine runs against the task's
    /// subscriber set as it stands *after* the auto-subscribe. A fan-out
    /// failure fails the whole post: the caller must not believe
    /// notifications were recorded when they were not.
    ///
    /// A message referencing a missing task (deleted mid-flight) still
    /// posts: explicit mentions are notified, subscriber fan-out is skipped.
    pub async fn post(&self, input: NewMessage) -> Result<PostedMessage> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let mentions_json =
            serde_json::to_string(&input.mentions).context("failed to encode mentions")?;
        let attachments_json = serde_json::to_string(&input.attachment_ids)
            .context("failed to encode attachment ids")?;

        sqlx::query(
            "INSERT INTO messages (id, task_id, from_agent_id, content, mentions, attachment_ids, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message_id)
        .bind(&input.task_id)
        .bind(&input.from_agent_id)
        .bind(&input.content)
        .bind(&mentions_json)
        .bind(&attachments_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to insert message")?;

        let task = self.tasks.get(&input.task_id).await?;
        if task.is_some() {
            self.tasks
                .subscribe(&input.task_id, &input.from_agent_id)
                .await?;
        }

        self.tasks
            .record_activity(
                ActivityKind::MessageSent,
                &input.from_agent_id,
                "Commented on task",
                Some(&input.task_id),
            )
            .await?;

        // Read the subscriber set at fan-out time, never earlier: the
        // auto-subscribe above must be visible here.
        let subscribers = match task {
            Some(_) => Some(self.tasks.subscribers(&input.task_id).await?),
            None => None,
        };

        let notified = fanout::fan_out(
            &self.notifications,
            &input.from_agent_id,
            &input.content,
            &input.task_id,
            &input.mentions,
            subscribers.as_deref(),
        )
        .await?;

        tracing::info!(
            message_id = %message_id,
            task_id = %input.task_id,
            from = %input.from_agent_id,
            notified = notified.len(),
            "message posted"
        );

        Ok(PostedMessage {
            message_id,
            notified,
        })
    }

    /// Messages on a task, oldest first.
    pub async fn for_task(&self, task_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, task_id, from_agent_id, content, mentions, attachment_ids, created_at
             FROM messages
             WHERE task_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch messages for task")?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    task_id: String,
    from_agent_id: String,
    content: String,
    mentions: Option<String>,
    attachment_ids: Option<String>,
    created_at: chrono::DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let mentions = decode_id_list(self.mentions.as_deref())
            .with_context(|| format!("invalid mentions JSON for message {}", self.id))?;
        let attachment_ids = decode_id_list(self.attachment_ids.as_deref())
            .with_context(|| format!("invalid attachment JSON for message {}", self.id))?;

        Ok(Message {
            id: self.id,
            task_id: self.task_id,
            from_agent_id: self.from_agent_id,
            content: self.content,
            mentions,
            attachment_ids,
            created_at: self.created_at,
        })
    }
}

fn decode_id_list(raw: Option<&str>) -> serde_json::Result<Vec<String>> {
    match raw {
        Some(raw) => serde_json::from_str(raw),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::tasks::store::CreateTaskInput;
    use crate::tasks::types::TaskPriority;

    async fn stores() -> (MessageStore, TaskStore, NotificationStore) {
        let pool = test_pool().await;
        (
            MessageStore::new(pool.clone()),
            TaskStore::new(pool.clone()),
            NotificationStore::new(pool),
        )
    }

    async fn create_task(tasks: &TaskStore, assignees: &[&str]) -> String {
        tasks
            .create(CreateTaskInput {
                title: "t".to_string(),
                description: String::new(),
                assignee_ids: assignees.iter().map(|s| s.to_string()).collect(),
                created_by: "creator".to_string(),
                priority: TaskPriority::Medium,
                tags: Vec::new(),
            })
            .await
            .expect("task should create")
            .id
    }

    fn message(task_id: &str, from: &str, content: &str, mentions: &[&str]) -> NewMessage {
        NewMessage {
            task_id: task_id.to_string(),
            from_agent_id: from.to_string(),
            content: content.to_string(),
            mentions: mentions.iter().map(|s| s.to_string()).collect(),
            attachment_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn posting_auto_subscribes_the_poster() {
        let (messages, tasks, _) = stores().await;
        let task_id = create_task(&tasks, &["a"]).await;

        messages
            .post(message(&task_id, "b", "hello", &[]))
            .await
            .expect("post should succeed");

        assert_eq!(tasks.subscribers(&task_id).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn mention_on_task_with_one_assignee_notifies_exactly_the_mention() {
        // Spec scenario: T1 assigned to "a"; "b" posts mentioning ["a"].
        let (messages, tasks, notifications) = stores().await;
        let task_id = create_task(&tasks, &["a"]).await;

        let posted = messages
            .post(message(&task_id, "b", "hey @a", &["a"]))
            .await
            .unwrap();

        assert_eq!(posted.notified, vec!["a"]);
        let rows = notifications.get_undelivered("a").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].from_agent_id, "b");
        assert_eq!(rows[0].task_id.as_deref(), Some(task_id.as_str()));
    }

    #[tokio::test]
    async fn subscriber_post_without_mentions_notifies_other_subscribers_only() {
        // Spec scenario: "a" (a subscriber) posts with no mentions.
        let (messages, tasks, notifications) = stores().await;
        let task_id = create_task(&tasks, &["a", "c"]).await;

        let posted = messages
            .post(message(&task_id, "a", "status update", &[]))
            .await
            .unwrap();

        assert_eq!(posted.notified, vec!["c"]);
        assert!(notifications.get_undelivered("a").await.unwrap().is_empty());
        assert_eq!(notifications.get_undelivered("c").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mentioned_subscriber_gets_one_notification_not_two() {
        // Spec scenario: "a" is both mentioned and already a subscriber.
        let (messages, tasks, notifications) = stores().await;
        let task_id = create_task(&tasks, &["a"]).await;

        let posted = messages
            .post(message(&task_id, "b", "hey @a again", &["a"]))
            .await
            .unwrap();

        assert_eq!(posted.notified, vec!["a"]);
        assert_eq!(notifications.get_undelivered("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_task_fires_mentions_but_skips_subscribers() {
        let (messages, _, notifications) = stores().await;

        let posted = messages
            .post(message("no-such-task", "b", "orphan ping @a", &["a"]))
            .await
            .expect("post should still succeed");

        assert_eq!(posted.notified, vec!["a"]);
        assert_eq!(notifications.get_undelivered("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exactly_one_activity_row_per_message() {
        let (messages, tasks, _) = stores().await;
        let task_id = create_task(&tasks, &["a"]).await;

        messages
            .post(message(&task_id, "b", "hello @a", &["a"]))
            .await
            .unwrap();

        let activities = tasks.activities(&task_id).await.unwrap();
        let sent: Vec<_> = activities
            .iter()
            .filter(|a| a.kind == "message_sent")
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].agent_id, "b");
    }

    #[tokio::test]
    async fn for_task_returns_messages_oldest_first() {
        let (messages, tasks, _) = stores().await;
        let task_id = create_task(&tasks, &[]).await;

        messages.post(message(&task_id, "a", "first", &[])).await.unwrap();
        messages.post(message(&task_id, "b", "second", &[])).await.unwrap();

        let thread = messages.for_task(&task_id).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].content, "first");
        assert_eq!(thread[1].content, "second");
    }
}
