//! Token-bucket rate limiting in front of the LLM, plus per-API usage
//! accounting.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `tokens_per_interval` tokens become available every
/// `interval`, accumulating up to `capacity`. Refill is pro-rata over
/// elapsed time.
#[derive(Clone)]
pub struct TokenBucket {
    tokens_per_interval: f64,
    interval: Duration,
    capacity: f64,
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucket {
    pub fn new(tokens_per_interval: u64, interval: Duration, capacity: u64) -> Self {
        Self {
            tokens_per_interval: tokens_per_interval as f64,
            interval,
            capacity: capacity as f64,
            state: Arc::new(Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        let gained =
            elapsed.as_secs_f64() / self.interval.as_secs_f64() * self.tokens_per_interval;
        state.tokens = (state.tokens + gained).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Take `n` tokens without waiting. Returns false when short.
    pub async fn try_acquire(&self, n: u64) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Take `n` tokens, sleeping until the deficit refills. The wait is
    /// computed deterministically from the deficit:
    /// `(n - available) * interval / tokens_per_interval`.
    pub async fn acquire(&self, n: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= n as f64 {
                    state.tokens -= n as f64;
                    return;
                }
                let deficit = n as f64 - state.tokens;
                Duration::from_secs_f64(
                    deficit / self.tokens_per_interval * self.interval.as_secs_f64(),
                )
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (after refill).
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiUsage {
    pub requests: u64,
    pub tokens: u64,
    pub errors: u64,
    pub last_request_time: Option<DateTime<Utc>>,
}

/// Per-API usage counters. Keys are API labels ("anthropic", "reflection").
#[derive(Clone, Default)]
pub struct UsageTracker {
    inner: Arc<Mutex<BTreeMap<String, ApiUsage>>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request and its token count.
    pub async fn record_request(&self, api: &str, tokens: u64) {
        let mut inner = self.inner.lock().await;
        let usage = inner.entry(api.to_string()).or_default();
        usage.requests += 1;
        usage.tokens += tokens;
        usage.last_request_time = Some(Utc::now());
    }

    pub async fn record_error(&self, api: &str) {
        let mut inner = self.inner.lock().await;
        let usage = inner.entry(api.to_string()).or_default();
        usage.errors += 1;
    }

    pub async fn usage(&self, api: &str) -> ApiUsage {
        self.inner.lock().await.get(api).cloned().unwrap_or_default()
    }

    /// Deterministic human-readable report, sorted by API label.
    pub async fn report(&self) -> String {
        let inner = self.inner.lock().await;
        let mut out = String::from("api usage:\n");
        for (api, usage) in inner.iter() {
            out.push_str(&format!(
                "  {}: requests={} tokens={} errors={}\n",
                api, usage.requests, usage.tokens, usage.errors
            ));
        }
        out
    }
}
