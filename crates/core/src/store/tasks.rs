//! Task rows and the append-only tool-call log.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Task, TaskStatus, ToolCallRow};

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    session_id: String,
    description: String,
    status: String,
    result: Option<String>,
    iterations: i64,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(r: TaskRow) -> Self {
        Self {
            id: Uuid::parse_str(&r.id).unwrap_or_default(),
            session_id: r.session_id,
            description: r.description,
            status: TaskStatus::parse(&r.status).unwrap_or(TaskStatus::Failed),
            result: r.result,
            iterations: r.iterations,
            created_at: r.created_at,
            completed_at: r.completed_at,
        }
    }
}

const TASK_COLS: &str =
    "id, session_id, description, status, result, iterations, created_at, completed_at";

pub async fn create(pool: &SqlitePool, session_id: &str, description: &str) -> Result<Task> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO tasks (id, session_id, description, status, iterations, created_at) \
         VALUES (?, ?, ?, 'running', 0, ?)",
    )
    .bind(id.to_string())
    .bind(session_id)
    .bind(description)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Task {
        id,
        session_id: session_id.to_string(),
        description: description.to_string(),
        status: TaskStatus::Running,
        result: None,
        iterations: 0,
        created_at: now,
        completed_at: None,
    })
}

/// Monotonically increment the iteration counter. Returns the new value.
pub async fn bump_iterations(pool: &SqlitePool, task_id: Uuid) -> Result<i64> {
    sqlx::query("UPDATE tasks SET iterations = iterations + 1 WHERE id = ?")
        .bind(task_id.to_string())
        .execute(pool)
        .await?;
    let (n,): (i64,) = sqlx::query_as("SELECT iterations FROM tasks WHERE id = ?")
        .bind(task_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Set a terminal status. The guard on `status = 'running'` makes the
/// terminal state write-once: a second call is a no-op returning false.
pub async fn finish(
    pool: &SqlitePool,
    task_id: Uuid,
    status: TaskStatus,
    result: Option<&str>,
) -> Result<bool> {
    debug_assert!(status.is_terminal());
    let updated = sqlx::query(
        "UPDATE tasks SET status = ?, result = ?, completed_at = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(result)
    .bind(Utc::now())
    .bind(task_id.to_string())
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() > 0)
}

pub async fn get(pool: &SqlitePool, task_id: Uuid) -> Result<Option<Task>> {
    let row: Option<TaskRow> =
        sqlx::query_as(&format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?"))
            .bind(task_id.to_string())
            .fetch_optional(pool)
            .await?;
    Ok(row.map(Into::into))
}

/// Most recent tasks for one session, newest first.
pub async fn recent_for_session(
    pool: &SqlitePool,
    session_id: &str,
    limit: i64,
) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        "SELECT {TASK_COLS} FROM tasks WHERE session_id = ? ORDER BY created_at DESC LIMIT ?"
    ))
    .bind(session_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Most recent task descriptions for one session, newest first.
pub async fn recent_descriptions(
    pool: &SqlitePool,
    session_id: &str,
    limit: i64,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT description FROM tasks WHERE session_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(session_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

/// Append to the tool-call log. The caller replaces image payloads with a
/// placeholder before handing over `output`.
pub async fn log_tool_call(
    pool: &SqlitePool,
    task_id: Uuid,
    tool_name: &str,
    input_json: &str,
    output: &str,
    success: bool,
    execution_time_ms: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO tool_calls (id, task_id, tool_name, input_json, output, success, execution_time_ms, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(task_id.to_string())
    .bind(tool_name)
    .bind(input_json)
    .bind(output)
    .bind(success)
    .bind(execution_time_ms)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct ToolCallRowRaw {
    id: String,
    task_id: String,
    tool_name: String,
    input_json: String,
    output: String,
    success: bool,
    execution_time_ms: i64,
    created_at: DateTime<Utc>,
}

pub async fn tool_calls_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<ToolCallRow>> {
    let rows: Vec<ToolCallRowRaw> = sqlx::query_as(
        "SELECT id, task_id, tool_name, input_json, output, success, execution_time_ms, created_at \
         FROM tool_calls WHERE task_id = ? ORDER BY created_at ASC",
    )
    .bind(task_id.to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| ToolCallRow {
            id: Uuid::parse_str(&r.id).unwrap_or_default(),
            task_id: Uuid::parse_str(&r.task_id).unwrap_or_default(),
            tool_name: r.tool_name,
            input_json: r.input_json,
            output: r.output,
            success: r.success,
            execution_time_ms: r.execution_time_ms,
            created_at: r.created_at,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn create_and_bump() {
        let store = Store::open_in_memory().await.unwrap();
        let task = create(store.pool(), "s1", "count files").await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(bump_iterations(store.pool(), task.id).await.unwrap(), 1);
        assert_eq!(bump_iterations(store.pool(), task.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn terminal_status_is_write_once() {
        let store = Store::open_in_memory().await.unwrap();
        let task = create(store.pool(), "s1", "t").await.unwrap();

        assert!(finish(store.pool(), task.id, TaskStatus::Completed, Some("done")).await.unwrap());
        // Second terminal write is ignored.
        assert!(!finish(store.pool(), task.id, TaskStatus::Failed, Some("late")).await.unwrap());

        let task = get(store.pool(), task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn tool_call_requires_parent_task() {
        let store = Store::open_in_memory().await.unwrap();
        let orphan = Uuid::new_v4();
        let err = log_tool_call(store.pool(), orphan, "shell", "{}", "out", true, 3).await;
        assert!(err.is_err(), "FK must reject a tool call without a task");

        let task = create(store.pool(), "s1", "t").await.unwrap();
        log_tool_call(store.pool(), task.id, "shell", "{}", "out", true, 3).await.unwrap();
        let calls = tool_calls_for_task(store.pool(), task.id).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "shell");
    }

    #[tokio::test]
    async fn recent_for_session_is_isolated_and_ordered() {
        let store = Store::open_in_memory().await.unwrap();
        create(store.pool(), "a", "first").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        create(store.pool(), "a", "second").await.unwrap();
        create(store.pool(), "b", "other session").await.unwrap();

        let recent = recent_descriptions(store.pool(), "a", 5).await.unwrap();
        assert_eq!(recent, vec!["second".to_string(), "first".to_string()]);
    }
}
