//! Conversation rows: per-session chat history, prunable to the last N.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{ChatRole, ConversationRow};

#[derive(sqlx::FromRow)]
struct Row {
    id: String,
    session_id: String,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl From<Row> for ConversationRow {
    fn from(r: Row) -> Self {
        Self {
            id: Uuid::parse_str(&r.id).unwrap_or_default(),
            session_id: r.session_id,
            role: ChatRole::parse(&r.role).unwrap_or(ChatRole::User),
            content: r.content,
            created_at: r.created_at,
        }
    }
}

pub async fn append(
    pool: &SqlitePool,
    session_id: &str,
    role: ChatRole,
    content: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO conversations (id, session_id, role, content, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(session_id)
    .bind(role.as_str())
    .bind(content)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Last `limit` rows for a session, returned oldest-first so they can be
/// replayed directly into a message list.
pub async fn history(
    pool: &SqlitePool,
    session_id: &str,
    limit: i64,
) -> Result<Vec<ConversationRow>> {
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT id, session_id, role, content, created_at FROM ( \
           SELECT id, session_id, role, content, created_at FROM conversations \
           WHERE session_id = ? ORDER BY created_at DESC LIMIT ?) \
         ORDER BY created_at ASC",
    )
    .bind(session_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn clear(pool: &SqlitePool, session_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM conversations WHERE session_id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Keep only the newest `n` rows of a session.
pub async fn prune_to_last(pool: &SqlitePool, session_id: &str, n: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM conversations WHERE session_id = ? AND id NOT IN ( \
           SELECT id FROM conversations WHERE session_id = ? \
           ORDER BY created_at DESC LIMIT ?)",
    )
    .bind(session_id)
    .bind(session_id)
    .bind(n)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn count(pool: &SqlitePool, session_id: &str) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(pool)
            .await?;
    Ok(n)
}
