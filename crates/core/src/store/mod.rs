//! Embedded state store: one SQLite file, sole owner of persisted rows.
//!
//! Entity modules expose typed async operations over the pool; the
//! [`Store`] handle owns the pool lifecycle and carries the event bus into
//! the mutations that publish updates.

pub mod conversation;
pub mod knowledge;
pub mod memory;
pub mod survival;
pub mod tasks;
pub mod thoughts;
pub mod timeline;

use futures_util::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use crate::bus::{Bus, Topic};
use crate::error::Result;
use crate::types::{Knowledge, Task, TaskStatus, Thought};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    bus: Bus,
}

impl Store {
    /// Open (creating if missing) the store file and apply migrations.
    pub async fn open(path: impl AsRef<Path>, bus: Bus) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;
        sqlx::migrate!("../../migrations").run(&pool).await?;
        Ok(Self { pool, bus })
    }

    /// In-memory store for tests. Single connection — SQLite in-memory
    /// databases are per-connection.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("../../migrations").run(&pool).await?;
        Ok(Self { pool, bus: Bus::default() })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Run `f` inside a single transaction; rolled back on error.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(
            &'t mut sqlx::Transaction<'static, sqlx::Sqlite>,
        ) -> BoxFuture<'t, Result<T>>,
    {
        let mut tx = self.pool.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Flush the WAL and release the pool.
    pub async fn close(&self) -> Result<()> {
        let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool).await;
        self.pool.close().await;
        Ok(())
    }

    // ── Publishing mutations ──
    //
    // State mutations that stream subscribers care about go through these
    // wrappers so the bus stays a plain injected value.

    pub async fn task_create(&self, session_id: &str, description: &str) -> Result<Task> {
        let task = tasks::create(&self.pool, session_id, description).await?;
        let payload = serde_json::to_value(&task).unwrap_or_default();
        self.bus.publish(Topic::Tasks, "task_update", payload.clone());
        self.bus.publish(Topic::Timeline, "task_update", payload);
        Ok(task)
    }

    /// Set a terminal status exactly once. Returns false when the task was
    /// already terminal (the write is ignored).
    pub async fn task_finish(
        &self,
        task_id: uuid::Uuid,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<bool> {
        let updated = tasks::finish(&self.pool, task_id, status, result).await?;
        if updated {
            if let Some(task) = tasks::get(&self.pool, task_id).await? {
                let payload = serde_json::to_value(&task).unwrap_or_default();
                self.bus.publish(Topic::Tasks, "task_update", payload.clone());
                self.bus.publish(Topic::Timeline, "task_update", payload);
            }
        }
        Ok(updated)
    }

    pub async fn thought_insert(
        &self,
        content: &str,
        summary: &str,
        category: &str,
    ) -> Result<Thought> {
        let thought = thoughts::insert(&self.pool, content, summary, category).await?;
        let payload = serde_json::to_value(&thought).unwrap_or_default();
        self.bus.publish(Topic::Thoughts, "thought", payload.clone());
        self.bus.publish(Topic::Timeline, "thought", payload);
        Ok(thought)
    }

    pub async fn knowledge_insert(
        &self,
        content: &str,
        summary: &str,
        source: &str,
        importance: i64,
        embedding: Option<&[f32]>,
    ) -> Result<Knowledge> {
        let row = knowledge::insert(&self.pool, content, summary, source, importance, embedding)
            .await?;
        let payload = serde_json::to_value(&row).unwrap_or_default();
        self.bus.publish(Topic::Timeline, "knowledge", payload);
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;

    #[tokio::test]
    async fn open_in_memory_migrates() {
        let store = Store::open_in_memory().await.unwrap();
        let n: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(n.0, 0);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().await.unwrap();
        let result: Result<()> = store
            .with_transaction(|tx| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO memories (key, value, category, importance, access_count, created_at, updated_at) \
                         VALUES ('k', 'v', 'c', 5, 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                    )
                    .execute(&mut **tx)
                    .await?;
                    Err(AgentError::Fatal("induced".into()))
                })
            })
            .await;
        assert!(result.is_err());

        let n: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM memories")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(n.0, 0, "insert must have been rolled back");
    }

    #[tokio::test]
    async fn task_create_publishes_to_tasks_and_timeline() {
        let store = Store::open_in_memory().await.unwrap();
        let mut tasks_rx = store.bus().subscribe(Topic::Tasks);
        let mut timeline_rx = store.bus().subscribe(Topic::Timeline);

        store.task_create("s1", "do something").await.unwrap();

        assert_eq!(tasks_rx.recv().await.unwrap().kind, "task_update");
        assert_eq!(timeline_rx.recv().await.unwrap().kind, "task_update");
    }
}
