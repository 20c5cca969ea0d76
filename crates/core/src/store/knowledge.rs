//! Knowledge rows plus the fixed-dimension vector side index.
//!
//! Vectors are stored L2-normalized as little-endian f32 blobs keyed by
//! knowledge id, so cosine distance reduces to `1 - dot`. The store never
//! produces embeddings — it accepts them on write and on query.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Knowledge;

#[derive(sqlx::FromRow)]
struct Row {
    id: String,
    content: String,
    summary: String,
    source: String,
    importance: i64,
    created_at: DateTime<Utc>,
}

impl From<Row> for Knowledge {
    fn from(r: Row) -> Self {
        Self {
            id: Uuid::parse_str(&r.id).unwrap_or_default(),
            content: r.content,
            summary: r.summary,
            source: r.source,
            importance: r.importance,
            created_at: r.created_at,
        }
    }
}

const COLS: &str = "id, content, summary, source, importance, created_at";

fn encode_vector(v: &[f32]) -> Vec<u8> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let scale = if norm > 0.0 { 1.0 / norm } else { 0.0 };
    v.iter().flat_map(|x| (x * scale).to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Insert a knowledge row and (optionally) its vector in one transaction.
pub async fn insert(
    pool: &SqlitePool,
    content: &str,
    summary: &str,
    source: &str,
    importance: i64,
    embedding: Option<&[f32]>,
) -> Result<Knowledge> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let importance = importance.clamp(1, 10);

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO knowledge (id, content, summary, source, importance, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(content)
    .bind(summary)
    .bind(source)
    .bind(importance)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if let Some(vector) = embedding {
        sqlx::query("INSERT INTO knowledge_vectors (knowledge_id, embedding) VALUES (?, ?)")
            .bind(id.to_string())
            .bind(encode_vector(vector))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(Knowledge {
        id,
        content: content.to_string(),
        summary: summary.to_string(),
        source: source.to_string(),
        importance,
        created_at: now,
    })
}

/// K nearest rows by cosine distance over normalized vectors, ascending,
/// ties broken by id. Returns empty (with a warning) when the vector
/// index holds nothing.
pub async fn search_vector(
    pool: &SqlitePool,
    query_embedding: &[f32],
    k: usize,
) -> Result<Vec<(Knowledge, f32)>> {
    let vectors: Vec<(String, Vec<u8>)> =
        sqlx::query_as("SELECT knowledge_id, embedding FROM knowledge_vectors")
            .fetch_all(pool)
            .await?;
    if vectors.is_empty() {
        tracing::warn!("vector index is empty, vector search returns nothing");
        return Ok(vec![]);
    }

    let query = decode_vector(&encode_vector(query_embedding));
    let mut scored: Vec<(String, f32)> = vectors
        .into_iter()
        .map(|(id, blob)| {
            let v = decode_vector(&blob);
            (id, 1.0 - dot(&query, &v))
        })
        .collect();
    scored.sort_by(|(ida, da), (idb, db)| {
        da.partial_cmp(db).unwrap_or(std::cmp::Ordering::Equal).then_with(|| ida.cmp(idb))
    });
    scored.truncate(k);

    let mut out = Vec::with_capacity(scored.len());
    for (id, distance) in scored {
        let row: Option<Row> =
            sqlx::query_as(&format!("SELECT {COLS} FROM knowledge WHERE id = ?"))
                .bind(&id)
                .fetch_optional(pool)
                .await?;
        if let Some(row) = row {
            out.push((row.into(), distance));
        }
    }
    Ok(out)
}

/// Keyword fallback over summary/content.
pub async fn search_keyword(
    pool: &SqlitePool,
    query: &str,
    limit: i64,
) -> Result<Vec<Knowledge>> {
    let pattern = format!("%{query}%");
    let rows: Vec<Row> = sqlx::query_as(&format!(
        "SELECT {COLS} FROM knowledge \
         WHERE summary LIKE ? OR content LIKE ? ORDER BY created_at DESC LIMIT ?"
    ))
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM knowledge").fetch_one(pool).await?;
    Ok(n)
}

/// Evict beyond the cap by ascending (importance, created_at). Vector rows
/// go with their parents via FK cascade.
pub async fn prune(pool: &SqlitePool, cap: i64) -> Result<u64> {
    let total = count(pool).await?;
    if total <= cap {
        return Ok(0);
    }
    let excess = total - cap;
    let result = sqlx::query(
        "DELETE FROM knowledge WHERE id IN ( \
           SELECT id FROM knowledge ORDER BY importance ASC, created_at ASC LIMIT ?)",
    )
    .bind(excess)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
