//! TaskStore: CRUD operations for tasks, subscriber sets, and the activity feed.

use crate::error::Result;
use crate::tasks::types::{Activity, ActivityKind, Task, TaskPriority, TaskStatus};

use anyhow::Context as _;
use chrono::Utc;
use sqlx::SqlitePool;

/// Persistent store for tasks, backed by the instance SQLite database.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct CreateTaskInput {
    pub title: String,
    pub description: String,
    pub assignee_ids: Vec<String>,
    pub created_by: String,
    pub priority: TaskPriority,
    pub tags: Vec<String>,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a task. The assignee set seeds the subscriber set, and a
    /// `task_created` activity is recorded in the same transaction.
    pub async fn create(&self, input: CreateTaskInput) -> Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let tags_json =
            serde_json::to_string(&input.tags).context("failed to encode task tags")?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin task creation transaction")?;

        sqlx::query(
            "INSERT INTO tasks (id, title, description, status, priority, created_by, tags, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.title)
        .bind(&input.description)
        .bind(TaskStatus::Inbox.as_str())
        .bind(input.priority.as_str())
        .bind(&input.created_by)
        .bind(&tags_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to insert task")?;

        for agent_id in &input.assignee_ids {
            sqlx::query("INSERT OR IGNORE INTO task_assignees (task_id, agent_id) VALUES (?, ?)")
                .bind(&id)
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .context("failed to insert task assignee")?;
            sqlx::query("INSERT OR IGNORE INTO task_subscribers (task_id, agent_id) VALUES (?, ?)")
                .bind(&id)
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .context("failed to seed task subscriber")?;
        }

        sqlx::query(
            "INSERT INTO activities (id, kind, agent_id, message, task_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(ActivityKind::TaskCreated.as_str())
        .bind(&input.created_by)
        .bind(format!("Created task: {}", input.title))
        .bind(&id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to record task_created activity")?;

        tx.commit()
            .await
            .context("failed to commit task creation")?;

        Ok(Task {
            id,
            title: input.title,
            description: input.description,
            status: TaskStatus::Inbox,
            priority: input.priority,
            created_by: input.created_by,
            tags: input.tags,
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a task by id.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, title, description, status, priority, created_by, tags, created_at, updated_at
             FROM tasks
             WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch task by id")?;

        row.map(TaskRow::into_task).transpose()
    }

    /// Change a task's status, recording a `status_changed` activity when the
    /// status actually changes.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        agent_id: &str,
    ) -> Result<()> {
        let Some(task) = self.get(task_id).await? else {
            return Err(anyhow::anyhow!("task not found: {task_id}").into());
        };
        if task.status == status {
            return Ok(());
        }

        let now = Utc::now();
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("failed to update task status")?;

        self.record_activity(
            ActivityKind::StatusChanged,
            agent_id,
            &format!("Changed status from {} to {}", task.status, status),
            Some(task_id),
        )
        .await
    }

    /// Replace a task's assignees. New assignees are unioned into the
    /// subscriber set; the subscriber set never shrinks.
    pub async fn update_assignees(&self, task_id: &str, assignee_ids: &[String]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin assignee update transaction")?;

        sqlx::query("DELETE FROM task_assignees WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear task assignees")?;

        for agent_id in assignee_ids {
            sqlx::query("INSERT OR IGNORE INTO task_assignees (task_id, agent_id) VALUES (?, ?)")
                .bind(task_id)
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .context("failed to insert task assignee")?;
            sqlx::query("INSERT OR IGNORE INTO task_subscribers (task_id, agent_id) VALUES (?, ?)")
                .bind(task_id)
                .bind(agent_id)
                .execute(&mut *tx)
                .await
                .context("failed to union assignee into subscribers")?;
        }

        sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .context("failed to bump task updated_at")?;

        tx.commit()
            .await
            .context("failed to commit assignee update")?;

        Ok(())
    }

    /// Subscribe an agent to a task. Idempotent.
    pub async fn subscribe(&self, task_id: &str, agent_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO task_subscribers (task_id, agent_id) VALUES (?, ?)")
            .bind(task_id)
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .context("failed to subscribe agent to task")?;

        Ok(())
    }

    /// Current subscriber set, ordered by agent id for determinism.
    pub async fn subscribers(&self, task_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT agent_id FROM task_subscribers WHERE task_id = ? ORDER BY agent_id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch task subscribers")?;

        Ok(rows.into_iter().map(|(agent_id,)| agent_id).collect())
    }

    /// Current assignee set, ordered by agent id.
    pub async fn assignees(&self, task_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT agent_id FROM task_assignees WHERE task_id = ? ORDER BY agent_id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch task assignees")?;

        Ok(rows.into_iter().map(|(agent_id,)| agent_id).collect())
    }

    /// Append an activity feed entry.
    pub async fn record_activity(
        &self,
        kind: ActivityKind,
        agent_id: &str,
        message: &str,
        task_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO activities (id, kind, agent_id, message, task_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(kind.as_str())
        .bind(agent_id)
        .bind(message)
        .bind(task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to record activity")?;

        Ok(())
    }

    /// Activity feed for a task, oldest first.
    pub async fn activities(&self, task_id: &str) -> Result<Vec<Activity>> {
        let rows = sqlx::query_as::<_, ActivityRow>(
            "SELECT id, kind, agent_id, message, task_id, created_at
             FROM activities
             WHERE task_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch activities for task")?;

        Ok(rows.into_iter().map(ActivityRow::into_activity).collect())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    title: String,
    description: String,
    status: String,
    priority: String,
    created_by: String,
    tags: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid task status in database: {e}"))?;
        let priority: TaskPriority = self
            .priority
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid task priority in database: {e}"))?;
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .with_context(|| format!("invalid tags JSON for task {}", self.id))?;

        Ok(Task {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            priority,
            created_by: self.created_by,
            tags,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    id: String,
    kind: String,
    agent_id: String,
    message: String,
    task_id: Option<String>,
    created_at: chrono::DateTime<Utc>,
}

impl ActivityRow {
    fn into_activity(self) -> Activity {
        Activity {
            id: self.id,
            kind: self.kind,
            agent_id: self.agent_id,
            message: self.message,
            task_id: self.task_id,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn input(title: &str, assignees: &[&str], created_by: &str) -> CreateTaskInput {
        CreateTaskInput {
            title: title.to_string(),
            description: String::new(),
            assignee_ids: assignees.iter().map(|s| s.to_string()).collect(),
            created_by: created_by.to_string(),
            priority: TaskPriority::Medium,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_seeds_subscribers_from_assignees() {
        let store = TaskStore::new(test_pool().await);
        let task = store
            .create(input("Ship the launch page", &["a", "b"], "jarvis"))
            .await
            .expect("task should create");

        assert_eq!(task.status, TaskStatus::Inbox);
        assert_eq!(store.subscribers(&task.id).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.assignees(&task.id).await.unwrap(), vec!["a", "b"]);

        let activities = store.activities(&task.id).await.unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].kind, "task_created");
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let store = TaskStore::new(test_pool().await);
        let task = store.create(input("t", &["a"], "a")).await.unwrap();

        store.subscribe(&task.id, "b").await.unwrap();
        store.subscribe(&task.id, "b").await.unwrap();

        assert_eq!(store.subscribers(&task.id).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn reassignment_unions_subscribers_and_never_shrinks_them() {
        let store = TaskStore::new(test_pool().await);
        let task = store.create(input("t", &["a"], "a")).await.unwrap();

        store.update_assignees(&task.id, &["b".to_string()]).await.unwrap();

        assert_eq!(store.assignees(&task.id).await.unwrap(), vec!["b"]);
        // "a" keeps its subscription even though it is no longer assigned.
        assert_eq!(store.subscribers(&task.id).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn status_change_records_activity_once() {
        let store = TaskStore::new(test_pool().await);
        let task = store.create(input("t", &[], "a")).await.unwrap();

        store
            .update_status(&task.id, TaskStatus::InProgress, "a")
            .await
            .unwrap();
        // Same status again is a no-op.
        store
            .update_status(&task.id, TaskStatus::InProgress, "a")
            .await
            .unwrap();

        let activities = store.activities(&task.id).await.unwrap();
        let status_changes: Vec<_> = activities
            .iter()
            .filter(|a| a.kind == "status_changed")
            .collect();
        assert_eq!(status_changes.len(), 1);
        assert!(status_changes[0].message.contains("inbox"));
        assert!(status_changes[0].message.contains("in_progress"));

        let task = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }
}
