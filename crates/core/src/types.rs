//! Row types shared across the runtime. The store owns persistence;
//! everything else holds snapshots of these values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session id reserved for the consciousness driver. Its activity is
/// introspectable but isolated from user sessions.
pub const AUTONOMOUS_SESSION: &str = "autonomous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Stuck,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stuck => "stuck",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stuck" => Some(Self::Stuck),
            _ => None,
        }
    }

    /// Terminal statuses are immutable once set.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub session_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub iterations: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    pub category: String,
    pub importance: i64,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub tool_name: String,
    pub input_json: String,
    pub output: String,
    pub success: bool,
    pub execution_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "model" => Some(Self::Model),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: Uuid,
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thought {
    pub id: Uuid,
    pub content: String,
    pub summary: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knowledge {
    pub id: Uuid,
    pub content: String,
    pub summary: String,
    pub source: String,
    pub importance: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalEntry {
    pub id: Uuid,
    pub amount: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Discriminator for the unified timeline view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Thought,
    Knowledge,
    Task,
}

impl TimelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thought => "thought",
            Self::Knowledge => "knowledge",
            Self::Task => "task",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineItem {
    pub kind: TimelineKind,
    pub id: Uuid,
    pub content: String,
    pub summary: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
