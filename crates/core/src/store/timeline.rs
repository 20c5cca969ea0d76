//! Unified timeline: thoughts, knowledge and tasks under one shape,
//! newest first.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{TimelineItem, TimelineKind};

#[derive(sqlx::FromRow)]
struct Row {
    kind: String,
    id: String,
    content: String,
    summary: String,
    metadata: String,
    ts: DateTime<Utc>,
}

/// The derived view. Tasks contribute their description as content and
/// result as summary; per-kind details ride in `metadata`.
pub async fn fetch(pool: &SqlitePool, limit: i64) -> Result<Vec<TimelineItem>> {
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT 'thought' AS kind, id, content, summary, \
                json_object('category', category) AS metadata, created_at AS ts \
         FROM thoughts \
         UNION ALL \
         SELECT 'knowledge', id, content, summary, \
                json_object('source', source, 'importance', importance), created_at \
         FROM knowledge \
         UNION ALL \
         SELECT 'task', id, description, COALESCE(result, ''), \
                json_object('status', status, 'session_id', session_id, 'iterations', iterations), \
                created_at \
         FROM tasks \
         ORDER BY ts DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| TimelineItem {
            kind: match r.kind.as_str() {
                "thought" => TimelineKind::Thought,
                "knowledge" => TimelineKind::Knowledge,
                _ => TimelineKind::Task,
            },
            id: Uuid::parse_str(&r.id).unwrap_or_default(),
            content: r.content,
            summary: r.summary,
            metadata: serde_json::from_str(&r.metadata).unwrap_or(serde_json::Value::Null),
            timestamp: r.ts,
        })
        .collect())
}
