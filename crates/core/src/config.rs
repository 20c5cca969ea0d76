//! Config KV overlaid on built-in defaults.
//!
//! Values live in the `config` table as strings and are validated against
//! per-key rules on both read and write. Reads degrade gracefully — an
//! invalid persisted value falls back to the nearest bound or the default.
//! Writes are strict — an invalid value is rejected.

use chrono::Utc;
use regex::Regex;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{AgentError, Result};

/// Validation rule attached to a config key.
#[derive(Debug, Clone)]
pub enum ValueRule {
    IntRange { min: i64, max: i64 },
    FloatRange { min: f64, max: f64 },
    Bool,
    /// Value must match the pattern in full.
    Pattern(&'static str),
}

impl ValueRule {
    /// Check a raw string against this rule.
    pub fn validate(&self, raw: &str) -> bool {
        match self {
            Self::IntRange { min, max } => {
                raw.parse::<i64>().map(|v| v >= *min && v <= *max).unwrap_or(false)
            }
            Self::FloatRange { min, max } => {
                raw.parse::<f64>().map(|v| v >= *min && v <= *max).unwrap_or(false)
            }
            Self::Bool => matches!(raw, "true" | "false"),
            Self::Pattern(p) => compiled(p).is_match(raw),
        }
    }

    /// Coerce an invalid persisted value to the nearest legal one,
    /// or None when no sensible clamp exists (fall back to default).
    fn clamp(&self, raw: &str) -> Option<String> {
        match self {
            Self::IntRange { min, max } => {
                let v = raw.parse::<i64>().ok()?;
                Some(v.clamp(*min, *max).to_string())
            }
            Self::FloatRange { min, max } => {
                let v = raw.parse::<f64>().ok()?;
                Some(v.clamp(*min, *max).to_string())
            }
            Self::Bool | Self::Pattern(_) => None,
        }
    }
}

fn compiled(pattern: &'static str) -> &'static Regex {
    static CACHE: OnceLock<std::sync::Mutex<HashMap<&'static str, &'static Regex>>> =
        OnceLock::new();
    let cache = CACHE.get_or_init(|| std::sync::Mutex::new(HashMap::new()));
    let mut guard = cache.lock().expect("regex cache lock");
    *guard
        .entry(pattern)
        .or_insert_with(|| Box::leak(Box::new(Regex::new(pattern).expect("static pattern"))))
}

/// One config key: default value, rule, deletability.
struct KeySpec {
    key: &'static str,
    default: &'static str,
    rule: ValueRule,
    protected: bool,
}

const MODEL_PATTERN: &str =
    r"^(claude-|gpt-|o[134]-|gemini-|deepseek-|qwen)[A-Za-z0-9.\-]*$";

fn key_specs() -> &'static [KeySpec] {
    static SPECS: OnceLock<Vec<KeySpec>> = OnceLock::new();
    SPECS.get_or_init(|| {
        vec![
            KeySpec {
                key: "max_iterations",
                default: "100",
                rule: ValueRule::IntRange { min: 1, max: 1000 },
                protected: true,
            },
            KeySpec {
                key: "thinking_budget",
                default: "10000",
                rule: ValueRule::IntRange { min: 0, max: 100_000 },
                protected: false,
            },
            KeySpec {
                key: "tool_timeout_ms",
                default: "30000",
                rule: ValueRule::IntRange { min: 1000, max: 600_000 },
                protected: true,
            },
            KeySpec {
                key: "code_timeout_ms",
                default: "60000",
                rule: ValueRule::IntRange { min: 1000, max: 600_000 },
                protected: false,
            },
            KeySpec {
                key: "max_output_chars",
                default: "10000",
                rule: ValueRule::IntRange { min: 1000, max: 100_000 },
                protected: false,
            },
            KeySpec {
                key: "verbose",
                default: "false",
                rule: ValueRule::Bool,
                protected: false,
            },
            KeySpec {
                key: "temperature",
                default: "0.7",
                rule: ValueRule::FloatRange { min: 0.0, max: 2.0 },
                protected: false,
            },
            KeySpec {
                key: "model",
                default: "claude-sonnet-4-6",
                rule: ValueRule::Pattern(MODEL_PATTERN),
                protected: false,
            },
        ]
    })
}

fn spec_for(key: &str) -> Option<&'static KeySpec> {
    key_specs().iter().find(|s| s.key == key)
}

/// Read a key: persisted value if valid, else clamped, else default.
pub async fn get(pool: &SqlitePool, key: &str) -> Result<String> {
    let spec =
        spec_for(key).ok_or_else(|| AgentError::Config(format!("unknown config key: {key}")))?;

    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    let value = match row {
        Some((raw,)) => {
            if spec.rule.validate(&raw) {
                raw
            } else if let Some(clamped) = spec.rule.clamp(&raw) {
                tracing::warn!(key, raw, clamped, "invalid persisted config value, clamped");
                clamped
            } else {
                tracing::warn!(key, raw, default = spec.default, "invalid persisted config value, using default");
                spec.default.to_string()
            }
        }
        None => spec.default.to_string(),
    };
    Ok(value)
}

/// Write a key. Rejected when the value fails the key's rule.
pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    let spec =
        spec_for(key).ok_or_else(|| AgentError::Config(format!("unknown config key: {key}")))?;
    if !spec.rule.validate(value) {
        return Err(AgentError::Config(format!("invalid value for {key}: {value:?}")));
    }

    sqlx::query(
        "INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete an override, reverting the key to its default.
/// Protected keys cannot be removed.
pub async fn remove(pool: &SqlitePool, key: &str) -> Result<()> {
    let spec =
        spec_for(key).ok_or_else(|| AgentError::Config(format!("unknown config key: {key}")))?;
    if spec.protected {
        return Err(AgentError::Config(format!("config key {key} cannot be removed")));
    }
    sqlx::query("DELETE FROM config WHERE key = ?").bind(key).execute(pool).await?;
    Ok(())
}

/// All keys with their effective values.
pub async fn all(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let mut out = Vec::with_capacity(key_specs().len());
    for spec in key_specs() {
        out.push((spec.key.to_string(), get(pool, spec.key).await?));
    }
    Ok(out)
}

/// Typed snapshot of the config surface, taken once per agent run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub thinking_budget: u32,
    pub tool_timeout_ms: u64,
    pub code_timeout_ms: u64,
    pub max_output_chars: usize,
    pub verbose: bool,
    pub temperature: f32,
    pub model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            thinking_budget: 10_000,
            tool_timeout_ms: 30_000,
            code_timeout_ms: 60_000,
            max_output_chars: 10_000,
            verbose: false,
            temperature: 0.7,
            model: "claude-sonnet-4-6".into(),
        }
    }
}

impl AgentConfig {
    /// Load the effective config. Parse failures cannot occur here —
    /// `get` guarantees rule-satisfying values.
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        Ok(Self {
            max_iterations: get(pool, "max_iterations").await?.parse().unwrap_or(100),
            thinking_budget: get(pool, "thinking_budget").await?.parse().unwrap_or(10_000),
            tool_timeout_ms: get(pool, "tool_timeout_ms").await?.parse().unwrap_or(30_000),
            code_timeout_ms: get(pool, "code_timeout_ms").await?.parse().unwrap_or(60_000),
            max_output_chars: get(pool, "max_output_chars").await?.parse().unwrap_or(10_000),
            verbose: get(pool, "verbose").await? == "true",
            temperature: get(pool, "temperature").await?.parse().unwrap_or(0.7),
            model: get(pool, "model").await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn int_rule_bounds() {
        let rule = ValueRule::IntRange { min: 1, max: 1000 };
        assert!(rule.validate("1"));
        assert!(rule.validate("1000"));
        assert!(!rule.validate("0"));
        assert!(!rule.validate("1001"));
        assert!(!rule.validate("abc"));
    }

    #[test]
    fn float_rule_bounds() {
        let rule = ValueRule::FloatRange { min: 0.0, max: 2.0 };
        assert!(rule.validate("0.1"));
        assert!(!rule.validate("2.5"));
    }

    #[test]
    fn model_pattern_accepts_known_families() {
        let rule = ValueRule::Pattern(MODEL_PATTERN);
        assert!(rule.validate("claude-sonnet-4-6"));
        assert!(rule.validate("gpt-4o"));
        assert!(rule.validate("deepseek-chat"));
        assert!(rule.validate("qwen2.5-32b-instruct"));
        assert!(!rule.validate("totally-made-up"));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        set(store.pool(), "temperature", "0.1").await.unwrap();
        assert_eq!(get(store.pool(), "temperature").await.unwrap(), "0.1");
    }

    #[tokio::test]
    async fn set_rejects_out_of_range() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(set(store.pool(), "temperature", "2.5").await.is_err());
        assert!(set(store.pool(), "max_iterations", "0").await.is_err());
    }

    #[tokio::test]
    async fn protected_keys_cannot_be_removed() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(remove(store.pool(), "max_iterations").await.is_err());
        assert!(remove(store.pool(), "tool_timeout_ms").await.is_err());
        // Unprotected keys are fine.
        set(store.pool(), "verbose", "true").await.unwrap();
        remove(store.pool(), "verbose").await.unwrap();
        assert_eq!(get(store.pool(), "verbose").await.unwrap(), "false");
    }

    #[tokio::test]
    async fn invalid_persisted_value_clamps_on_read() {
        let store = Store::open_in_memory().await.unwrap();
        // Bypass validation by writing the row directly.
        sqlx::query("INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?)")
            .bind("max_iterations")
            .bind("99999")
            .bind(Utc::now())
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(get(store.pool(), "max_iterations").await.unwrap(), "1000");
    }

    #[tokio::test]
    async fn unparseable_persisted_value_falls_back_to_default() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?)")
            .bind("verbose")
            .bind("maybe")
            .bind(Utc::now())
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(get(store.pool(), "verbose").await.unwrap(), "false");
    }
}
