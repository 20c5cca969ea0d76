//! Context assembler: builds the system prompt for one agent run from
//! tool declarations, relevant memories and recent task history. Reads
//! only — never writes.

use anima_llm::provider::ToolDefinition;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::store::{memory, tasks};
use crate::types::AUTONOMOUS_SESSION;

const PREAMBLE: &str = "You are anima, a self-directed agent. You reason step by step, \
use tools to act on the world, and persist what you learn. Core principles: \
verify before you claim, prefer concrete actions over speculation, keep your \
outputs grounded in tool results, and stop when the task is done.";

const MEMORY_LIMIT: usize = 5;
const TASK_HISTORY_LIMIT: i64 = 5;
const BACKGROUND_LIMIT: i64 = 3;
const RESULT_PREFIX_CHARS: usize = 120;

fn prefix(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

/// Compose the system prompt. Sections beyond the preamble and tool list
/// appear only when they have content; the background-activity block is
/// omitted for the autonomous session itself.
pub async fn assemble(
    pool: &SqlitePool,
    declarations: &[ToolDefinition],
    user_message: &str,
    session_id: &str,
) -> Result<String> {
    let mut prompt = String::from(PREAMBLE);

    prompt.push_str("\n\n## Tools\n");
    for decl in declarations {
        prompt.push_str(&format!("- {}: {}\n", decl.name, decl.description));
    }

    let memories = memory::search(pool, user_message, MEMORY_LIMIT).await?;
    if !memories.is_empty() {
        prompt.push_str("\n## Relevant Memories\n");
        for entry in &memories {
            prompt.push_str(&format!(
                "- {} [{}]: {}\n",
                entry.key,
                entry.category,
                prefix(&entry.value, RESULT_PREFIX_CHARS)
            ));
        }
    }

    let history = tasks::recent_for_session(pool, session_id, TASK_HISTORY_LIMIT).await?;
    if !history.is_empty() {
        prompt.push_str("\n## Recent Task History\n");
        for task in &history {
            prompt.push_str(&format!(
                "- [{}] {}: {}\n",
                task.status.as_str(),
                prefix(&task.description, RESULT_PREFIX_CHARS),
                prefix(task.result.as_deref().unwrap_or(""), RESULT_PREFIX_CHARS)
            ));
        }
    }

    if session_id != AUTONOMOUS_SESSION {
        let background =
            tasks::recent_for_session(pool, AUTONOMOUS_SESSION, BACKGROUND_LIMIT).await?;
        if !background.is_empty() {
            prompt.push_str("\n## Background Activity\n");
            for task in &background {
                prompt.push_str(&format!(
                    "- [{}] {}\n",
                    task.status.as_str(),
                    prefix(&task.description, RESULT_PREFIX_CHARS)
                ));
            }
        }
    }

    Ok(prompt)
}
