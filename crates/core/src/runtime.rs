//! Top-level runtime handle: owns the store, tool registry, event bus,
//! rate limiter, browser singleton and shutdown coordinator, and hands
//! them to the agent loop and consciousness driver explicitly. No
//! globals — teardown is the ordered unwinding of this handle.

use anima_llm::provider::LlmProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

use crate::agent::{AgentEvent, AgentLoop, RunOptions};
use crate::bus::{Bus, BusEvent, Topic};
use crate::consciousness::{ConsciousnessDriver, Lease, LEASE_DURATION};
use crate::embedding::{default_embedder, Embedder};
use crate::error::{AgentError, Result};
use crate::ratelimit::{TokenBucket, UsageTracker};
use crate::shutdown::ShutdownCoordinator;
use crate::store::{knowledge, Store};
use crate::tools::browser::{BrowserHost, BrowserPolicy};
use crate::tools::ToolRegistry;
use crate::types::Knowledge;

/// Default cap on concurrent chat-stream runs.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 3;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub db_path: PathBuf,
    pub workspace: PathBuf,
    pub max_concurrent_runs: usize,
    /// Token-bucket budget in front of the LLM.
    pub llm_tokens_per_minute: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("anima.db"),
            workspace: PathBuf::from("workspace"),
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            llm_tokens_per_minute: 100_000,
        }
    }
}

pub struct Runtime {
    store: Store,
    bus: Bus,
    registry: Arc<ToolRegistry>,
    browser: Arc<BrowserHost>,
    limiter: TokenBucket,
    usage: UsageTracker,
    shutdown: Arc<ShutdownCoordinator>,
    lease: Arc<Lease>,
    provider: Arc<dyn LlmProvider>,
    reflection: Arc<dyn LlmProvider>,
    run_slots: Arc<Semaphore>,
    max_concurrent_runs: usize,
    conscious_guard: Arc<std::sync::atomic::AtomicBool>,
    embedder: Embedder,
    workspace: PathBuf,
}

impl Runtime {
    /// Open the store and wire every subsystem. `reflection` defaults to
    /// the primary provider when absent.
    pub async fn new(
        options: RuntimeOptions,
        provider: Arc<dyn LlmProvider>,
        reflection: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self> {
        let bus = Bus::default();
        let store = Store::open(&options.db_path, bus.clone()).await?;
        Self::assemble(options, store, bus, provider, reflection).await
    }

    /// In-memory runtime for tests.
    pub async fn new_in_memory(
        options: RuntimeOptions,
        provider: Arc<dyn LlmProvider>,
        reflection: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self> {
        let store = Store::open_in_memory().await?;
        let bus = store.bus().clone();
        Self::assemble(options, store, bus, provider, reflection).await
    }

    async fn assemble(
        options: RuntimeOptions,
        store: Store,
        bus: Bus,
        provider: Arc<dyn LlmProvider>,
        reflection: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&options.workspace)
            .map_err(|e| AgentError::Fatal(format!("cannot create workspace: {e}")))?;

        let shutdown = Arc::new(ShutdownCoordinator::new());
        let browser = Arc::new(BrowserHost::new(BrowserPolicy::default()));
        let registry = Arc::new(ToolRegistry::with_builtins(Arc::clone(&browser)));
        let limiter = TokenBucket::new(
            options.llm_tokens_per_minute,
            Duration::from_secs(60),
            options.llm_tokens_per_minute,
        );

        bus.spawn_heartbeat(shutdown.token());
        Arc::clone(&browser)
            .spawn_maintenance(options.workspace.join("screenshots"), shutdown.token());

        // Teardown in reverse order: browser first, store last.
        shutdown.register("store-close", {
            let store = store.clone();
            move || {
                Box::pin(async move {
                    if let Err(e) = store.close().await {
                        tracing::warn!(error = %e, "store close failed");
                    }
                })
            }
        });
        shutdown.register("browser-shutdown", {
            let browser = Arc::clone(&browser);
            move || Box::pin(async move { browser.shutdown().await })
        });

        Ok(Self {
            store,
            bus,
            registry,
            browser,
            limiter,
            usage: UsageTracker::new(),
            shutdown,
            lease: Arc::new(Lease::new()),
            reflection: reflection.unwrap_or_else(|| Arc::clone(&provider)),
            provider,
            run_slots: Arc::new(Semaphore::new(options.max_concurrent_runs)),
            max_concurrent_runs: options.max_concurrent_runs,
            conscious_guard: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            embedder: default_embedder(),
            workspace: options.workspace,
        })
    }

    fn agent_loop(&self) -> AgentLoop {
        AgentLoop::new(
            self.store.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.provider),
            self.limiter.clone(),
            self.usage.clone(),
            self.workspace.clone(),
        )
    }

    /// Start one user chat run. Enforces the concurrent-run cap and takes
    /// the consciousness lease. Dropping the returned receiver cancels
    /// the run.
    pub fn chat(
        &self,
        message: impl Into<String>,
        session_id: &str,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        if self.shutdown.is_shutting_down() {
            return Err(AgentError::Cancelled("runtime is shutting down".into()));
        }
        let permit = Arc::clone(&self.run_slots).try_acquire_owned().map_err(|_| {
            AgentError::Capacity(format!(
                "at most {} concurrent runs, try again shortly",
                self.max_concurrent_runs
            ))
        })?;
        self.lease.acquire(LEASE_DURATION);

        let mut opts = RunOptions::for_session(session_id);
        opts.cancel = self.shutdown.token().child_token();
        let cancel = opts.cancel.clone();
        let mut inner = self.agent_loop().run(message.into(), opts);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let _permit = permit; // released when the stream ends
            while let Some(event) = inner.recv().await {
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() {
                    // Consumer hung up: that is cancellation.
                    cancel.cancel();
                    break;
                }
                if terminal {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// Chat runs currently in flight.
    pub fn active_runs(&self) -> usize {
        self.max_concurrent_runs - self.run_slots.available_permits()
    }

    /// Start the consciousness driver. Returns None when one is already
    /// running.
    pub fn spawn_consciousness(&self) -> Option<tokio::task::JoinHandle<()>> {
        let driver = ConsciousnessDriver::new(
            self.store.clone(),
            self.agent_loop(),
            Arc::clone(&self.reflection),
            self.workspace.clone(),
            Arc::clone(&self.lease),
            self.shutdown.token(),
        )
        .with_running_guard(Arc::clone(&self.conscious_guard));
        driver.spawn()
    }

    /// Store a knowledge row with its embedding.
    pub async fn learn(
        &self,
        content: &str,
        summary: &str,
        source: &str,
        importance: i64,
    ) -> Result<Knowledge> {
        let embedding = (self.embedder)(content);
        self.store.knowledge_insert(content, summary, source, importance, Some(&embedding)).await
    }

    /// Vector search over stored knowledge.
    pub async fn recall(&self, query: &str, k: usize) -> Result<Vec<(Knowledge, f32)>> {
        let embedding = (self.embedder)(query);
        knowledge::search_vector(self.store.pool(), &embedding, k).await
    }

    pub fn subscribe(&self, topic: Topic) -> tokio::sync::broadcast::Receiver<BusEvent> {
        self.bus.subscribe(topic)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Swap in a real embedding function.
    pub fn set_embedder(&mut self, embedder: Embedder) {
        self.embedder = embedder;
    }

    /// Ordered teardown of everything this handle owns.
    pub async fn shutdown(&self) {
        self.shutdown.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_llm::provider::{
        CompletionRequest, CompletionResponse, LlmError, ScriptedProvider,
    };
    use std::future::Future;
    use std::pin::Pin;

    /// Provider that stalls long enough to keep runs in flight.
    struct SlowProvider;

    impl LlmProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }
        fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<CompletionResponse, LlmError>> + Send + '_>>
        {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(CompletionResponse::text("done"))
            })
        }
    }

    async fn runtime_with(provider: Arc<dyn LlmProvider>) -> Runtime {
        let options = RuntimeOptions {
            workspace: std::env::temp_dir().join(format!("anima-rt-{}", uuid::Uuid::new_v4())),
            ..Default::default()
        };
        Runtime::new_in_memory(options, provider, None).await.unwrap()
    }

    #[tokio::test]
    async fn chat_streams_to_done() {
        let runtime =
            runtime_with(Arc::new(ScriptedProvider::new(vec![CompletionResponse::text("hi")])))
                .await;
        let rx = runtime.chat("hello", "s1").unwrap();
        let events = crate::agent::collect_events(rx).await;
        assert!(matches!(events.last(), Some(AgentEvent::Done(t)) if t == "hi"));
    }

    #[tokio::test]
    async fn concurrent_runs_are_capped_and_observable() {
        let runtime = runtime_with(Arc::new(SlowProvider)).await;

        let _a = runtime.chat("one", "s1").unwrap();
        let _b = runtime.chat("two", "s2").unwrap();
        let _c = runtime.chat("three", "s3").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.active_runs(), 3);

        let rejected = runtime.chat("four", "s4");
        assert!(matches!(rejected, Err(AgentError::Capacity(_))));
    }

    #[tokio::test]
    async fn slots_free_up_after_completion() {
        let runtime = runtime_with(Arc::new(SlowProvider)).await;
        let rx = runtime.chat("one", "s1").unwrap();
        crate::agent::collect_events(rx).await;
        // Forward task drops the permit after the terminal event.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.active_runs(), 0);
    }

    #[tokio::test]
    async fn chat_takes_the_consciousness_lease() {
        let runtime =
            runtime_with(Arc::new(ScriptedProvider::new(vec![CompletionResponse::text("ok")])))
                .await;
        assert!(!runtime.lease.is_active());
        let rx = runtime.chat("hello", "s1").unwrap();
        assert!(runtime.lease.is_active());
        crate::agent::collect_events(rx).await;
    }

    #[tokio::test]
    async fn second_consciousness_spawn_is_refused() {
        let runtime =
            runtime_with(Arc::new(ScriptedProvider::new(vec![CompletionResponse::text("ok")])))
                .await;
        let first = runtime.spawn_consciousness();
        assert!(first.is_some());
        let second = runtime.spawn_consciousness();
        assert!(second.is_none(), "one driver at a time");
        runtime.shutdown().await;
        if let Some(handle) = first {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn learn_then_recall_round_trips() {
        let runtime =
            runtime_with(Arc::new(ScriptedProvider::new(vec![CompletionResponse::text("ok")])))
                .await;
        runtime
            .learn("tokio channels are mpsc by default", "tokio channels", "notes", 6)
            .await
            .unwrap();
        runtime.learn("sqlite needs WAL for writers", "sqlite wal", "notes", 6).await.unwrap();

        let hits = runtime.recall("tokio channels are mpsc by default", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.summary, "tokio channels");
    }

    #[tokio::test]
    async fn chat_is_rejected_during_shutdown() {
        let runtime =
            runtime_with(Arc::new(ScriptedProvider::new(vec![CompletionResponse::text("ok")])))
                .await;
        runtime.shutdown().await;
        assert!(matches!(runtime.chat("late", "s1"), Err(AgentError::Cancelled(_))));
    }
}
