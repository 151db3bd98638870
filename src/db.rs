//! Database connection management and migrations.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;
use std::path::Path;

/// SQLite connection bundle for the collaboration store.
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Connect to the instance database and run migrations.
    pub async fn connect(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("failed to create instance directory: {}", data_dir.display())
        })?;

        let db_path = data_dir.join("mission-control.db");
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("failed to connect to SQLite at {}", db_path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .with_context(|| "failed to run database migrations")?;

        Ok(Self { pool })
    }

    /// Close the database connection gracefully.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Migrated in-memory pool for tests. Capped at one connection because a
/// second pooled connection to `sqlite::memory:` would see a fresh, empty
/// database.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should connect");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations should apply");

    pool
}
