//! Memory KV: key-unique rows with keyword-scored search and
//! importance-based pruning.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::types::MemoryEntry;

#[derive(sqlx::FromRow)]
struct MemoryRow {
    key: String,
    value: String,
    category: String,
    importance: i64,
    access_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MemoryRow> for MemoryEntry {
    fn from(r: MemoryRow) -> Self {
        Self {
            key: r.key,
            value: r.value,
            category: r.category,
            importance: r.importance,
            access_count: r.access_count,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

const SELECT_COLS: &str =
    "key, value, category, importance, access_count, created_at, updated_at";

/// Insert or replace by key. Importance is clamped into 1..=10.
pub async fn upsert(
    pool: &SqlitePool,
    key: &str,
    value: &str,
    category: &str,
    importance: i64,
) -> Result<()> {
    let importance = importance.clamp(1, 10);
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO memories (key, value, category, importance, access_count, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 0, ?, ?) \
         ON CONFLICT (key) DO UPDATE SET \
           value = excluded.value, category = excluded.category, \
           importance = excluded.importance, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(category)
    .bind(importance)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch by key; a hit increments `access_count`.
pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<MemoryEntry>> {
    let row: Option<MemoryRow> =
        sqlx::query_as(&format!("SELECT {SELECT_COLS} FROM memories WHERE key = ?"))
            .bind(key)
            .fetch_optional(pool)
            .await?;
    let Some(row) = row else { return Ok(None) };

    sqlx::query("UPDATE memories SET access_count = access_count + 1 WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;

    let mut entry: MemoryEntry = row.into();
    entry.access_count += 1;
    Ok(Some(entry))
}

pub async fn delete(pool: &SqlitePool, key: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM memories WHERE key = ?").bind(key).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM memories").fetch_one(pool).await?;
    Ok(n)
}

pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<MemoryEntry>> {
    let rows: Vec<MemoryRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLS} FROM memories ORDER BY updated_at DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Keyword relevance of one entry against lowercase query tokens:
/// one point per token per matching field (key, value, category), plus
/// 0.1·importance plus 0.2·ln(1 + access_count).
fn score(entry: &MemoryEntry, tokens: &[String]) -> f64 {
    let key = entry.key.to_lowercase();
    let value = entry.value.to_lowercase();
    let category = entry.category.to_lowercase();

    let mut matched = 0u32;
    for token in tokens {
        for field in [&key, &value, &category] {
            if field.contains(token.as_str()) {
                matched += 1;
            }
        }
    }
    if matched == 0 {
        return 0.0;
    }
    matched as f64 + 0.1 * entry.importance as f64 + 0.2 * (1.0 + entry.access_count as f64).ln()
}

/// Keyword search. Deterministic for fixed table contents: score
/// descending, ties broken by importance then updated_at (newest first).
pub async fn search(pool: &SqlitePool, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
    let tokens: Vec<String> =
        query.to_lowercase().split_whitespace().map(str::to_string).collect();
    if tokens.is_empty() {
        return Ok(vec![]);
    }

    // Brute-force scan; the memory cap keeps the table small.
    let rows: Vec<MemoryRow> =
        sqlx::query_as(&format!("SELECT {SELECT_COLS} FROM memories")).fetch_all(pool).await?;

    let mut scored: Vec<(f64, MemoryEntry)> = rows
        .into_iter()
        .map(MemoryEntry::from)
        .filter_map(|e| {
            let s = score(&e, &tokens);
            (s > 0.0).then_some((s, e))
        })
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.importance.cmp(&a.importance))
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    scored.truncate(limit);
    Ok(scored.into_iter().map(|(_, e)| e).collect())
}

/// Drop the least valuable rows until at most `cap` remain. Eviction order
/// is ascending (importance, access_count, updated_at).
pub async fn prune(pool: &SqlitePool, cap: i64) -> Result<u64> {
    let total = count(pool).await?;
    if total <= cap {
        return Ok(0);
    }
    let excess = total - cap;
    let result = sqlx::query(
        "DELETE FROM memories WHERE key IN ( \
           SELECT key FROM memories \
           ORDER BY importance ASC, access_count ASC, updated_at ASC LIMIT ?)",
    )
    .bind(excess)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn upsert_is_key_unique() {
        let store = Store::open_in_memory().await.unwrap();
        upsert(store.pool(), "lang", "rust", "pref", 5).await.unwrap();
        upsert(store.pool(), "lang", "rust and sql", "pref", 7).await.unwrap();
        assert_eq!(count(store.pool()).await.unwrap(), 1);
        let entry = get(store.pool(), "lang").await.unwrap().unwrap();
        assert_eq!(entry.value, "rust and sql");
        assert_eq!(entry.importance, 7);
    }

    #[tokio::test]
    async fn get_increments_access_count() {
        let store = Store::open_in_memory().await.unwrap();
        upsert(store.pool(), "k", "v", "c", 5).await.unwrap();
        assert_eq!(get(store.pool(), "k").await.unwrap().unwrap().access_count, 1);
        assert_eq!(get(store.pool(), "k").await.unwrap().unwrap().access_count, 2);
        // Misses do not touch anything.
        assert!(get(store.pool(), "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn importance_clamped_to_range() {
        let store = Store::open_in_memory().await.unwrap();
        upsert(store.pool(), "a", "v", "c", 99).await.unwrap();
        upsert(store.pool(), "b", "v", "c", -3).await.unwrap();
        assert_eq!(get(store.pool(), "a").await.unwrap().unwrap().importance, 10);
        assert_eq!(get(store.pool(), "b").await.unwrap().unwrap().importance, 1);
    }

    #[tokio::test]
    async fn search_ranks_by_match_then_importance() {
        let store = Store::open_in_memory().await.unwrap();
        upsert(store.pool(), "rust-tips", "borrow checker notes", "dev", 3).await.unwrap();
        upsert(store.pool(), "deploy", "rust service deploy runbook", "ops", 9).await.unwrap();
        upsert(store.pool(), "recipes", "sourdough starter", "life", 10).await.unwrap();

        let hits = search(store.pool(), "rust", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        // Same single-token match count; the higher importance wins.
        assert_eq!(hits[0].key, "deploy");
        assert_eq!(hits[1].key, "rust-tips");
    }

    #[tokio::test]
    async fn search_is_deterministic() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..20 {
            upsert(store.pool(), &format!("note-{i}"), "shared topic text", "misc", 5)
                .await
                .unwrap();
        }
        let a: Vec<String> = search(store.pool(), "topic", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        let b: Vec<String> = search(store.pool(), "topic", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn prune_evicts_least_valuable_first() {
        let store = Store::open_in_memory().await.unwrap();
        upsert(store.pool(), "low", "v", "c", 1).await.unwrap();
        upsert(store.pool(), "mid", "v", "c", 5).await.unwrap();
        upsert(store.pool(), "high", "v", "c", 10).await.unwrap();

        let removed = prune(store.pool(), 2).await.unwrap();
        assert_eq!(removed, 1);
        assert!(get(store.pool(), "low").await.unwrap().is_none());
        assert!(get(store.pool(), "high").await.unwrap().is_some());
    }
}
