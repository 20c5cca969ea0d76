//! Append-only survival ledger. Balance is the sum of signed amounts;
//! an hourly routine appends debt proportional to elapsed time.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::types::SurvivalEntry;

pub const HOURLY_DEBT: f64 = 250.0 / 720.0;
pub const DAILY_DEBT: f64 = 250.0 / 30.0;

const DEBT_REASON: &str = "hourly debt";

#[derive(sqlx::FromRow)]
struct Row {
    id: String,
    amount: f64,
    reason: String,
    created_at: DateTime<Utc>,
}

impl From<Row> for SurvivalEntry {
    fn from(r: Row) -> Self {
        Self {
            id: Uuid::parse_str(&r.id).unwrap_or_default(),
            amount: r.amount,
            reason: r.reason,
            created_at: r.created_at,
        }
    }
}

async fn append(pool: &SqlitePool, amount: f64, reason: &str) -> Result<SurvivalEntry> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query("INSERT INTO survival_ledger (id, amount, reason, created_at) VALUES (?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(amount)
        .bind(reason)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(SurvivalEntry { id, amount, reason: reason.to_string(), created_at: now })
}

/// Append a positive entry.
pub async fn credit(pool: &SqlitePool, amount: f64, reason: &str) -> Result<SurvivalEntry> {
    append(pool, amount.abs(), reason).await
}

/// Append a negative entry.
pub async fn debit(pool: &SqlitePool, amount: f64, reason: &str) -> Result<SurvivalEntry> {
    append(pool, -amount.abs(), reason).await
}

/// Balance = sum of all amounts.
pub async fn balance(pool: &SqlitePool) -> Result<f64> {
    let (sum,): (Option<f64>,) =
        sqlx::query_as("SELECT SUM(amount) FROM survival_ledger").fetch_one(pool).await?;
    Ok(sum.unwrap_or(0.0))
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<SurvivalEntry>> {
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT id, amount, reason, created_at FROM survival_ledger \
         ORDER BY created_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Charge `hours_since_last_debt · hourly_rate`. The first call seeds the
/// debt clock with a zero entry instead of charging retroactively.
/// Returns the amount charged (0.0 when nothing was due).
pub async fn apply_hourly_debt(pool: &SqlitePool, hourly_rate: f64) -> Result<f64> {
    let last: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT created_at FROM survival_ledger WHERE reason = ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(DEBT_REASON)
    .fetch_optional(pool)
    .await?;

    let Some((last_at,)) = last else {
        append(pool, 0.0, DEBT_REASON).await?;
        return Ok(0.0);
    };

    let hours = (Utc::now() - last_at).num_milliseconds() as f64 / 3_600_000.0;
    if hours <= 0.0 {
        return Ok(0.0);
    }
    let due = hours * hourly_rate;
    append(pool, -due, DEBT_REASON).await?;
    Ok(due)
}
