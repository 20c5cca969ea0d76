//! Thought rows written by the consciousness driver, retained for a
//! bounded number of days.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Thought;

#[derive(sqlx::FromRow)]
struct Row {
    id: String,
    content: String,
    summary: String,
    category: String,
    created_at: DateTime<Utc>,
}

impl From<Row> for Thought {
    fn from(r: Row) -> Self {
        Self {
            id: Uuid::parse_str(&r.id).unwrap_or_default(),
            content: r.content,
            summary: r.summary,
            category: r.category,
            created_at: r.created_at,
        }
    }
}

pub async fn insert(
    pool: &SqlitePool,
    content: &str,
    summary: &str,
    category: &str,
) -> Result<Thought> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO thoughts (id, content, summary, category, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(content)
    .bind(summary)
    .bind(category)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(Thought {
        id,
        content: content.to_string(),
        summary: summary.to_string(),
        category: category.to_string(),
        created_at: now,
    })
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<Thought>> {
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT id, content, summary, category, created_at FROM thoughts \
         ORDER BY created_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM thoughts").fetch_one(pool).await?;
    Ok(n)
}

/// Delete thoughts older than the retention window.
pub async fn prune_older_than(pool: &SqlitePool, days: i64) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(days);
    let result = sqlx::query("DELETE FROM thoughts WHERE created_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn insert_and_recent() {
        let store = Store::open_in_memory().await.unwrap();
        insert(store.pool(), "long reflection", "short", "reflection").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        insert(store.pool(), "newer", "newer", "reflection").await.unwrap();

        let rows = recent(store.pool(), 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, "newer");
    }

    #[tokio::test]
    async fn prune_respects_retention() {
        let store = Store::open_in_memory().await.unwrap();
        insert(store.pool(), "fresh", "fresh", "reflection").await.unwrap();
        // Plant an old row directly.
        sqlx::query(
            "INSERT INTO thoughts (id, content, summary, category, created_at) VALUES (?, 'old', 'old', 'reflection', ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now() - Duration::days(30))
        .execute(store.pool())
        .await
        .unwrap();

        let removed = prune_older_than(store.pool(), 7).await.unwrap();
        assert_eq!(removed, 1);
        let rows = recent(store.pool(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "fresh");
    }
}
