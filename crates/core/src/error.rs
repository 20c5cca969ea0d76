use anima_llm::provider::LlmError;

/// Runtime error taxonomy. Tool-local failures never take this form —
/// they travel as data inside a `ToolResult`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Unrecoverable for the current operation: bad startup config,
    /// auth failure, corrupt store. Kills the operation, not the process.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Produced by the stuck detector; terminates the current run only.
    #[error("agent stuck: {0}")]
    Stuck(String),

    /// Cooperative cancellation or global shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invalid config: {0}")]
    Config(String),

    /// Concurrent-run cap reached; caller should back off.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("tool error: {0}")]
    Tool(String),
}

impl AgentError {
    /// True when retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Llm(e) => e.is_retryable(),
            Self::Store(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
