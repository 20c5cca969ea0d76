//! Graceful shutdown: a shared cancellation token plus ordered teardown
//! hooks, run in reverse registration order with per-hook failure
//! isolation.

use futures_util::future::BoxFuture;
use tokio::signal;
use tokio_util::sync::CancellationToken;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct ShutdownCoordinator {
    token: CancellationToken,
    hooks: std::sync::Mutex<Vec<(String, Hook)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), hooks: std::sync::Mutex::new(Vec::new()) }
    }

    /// The cancellation token that all long-running tasks should monitor.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register a named teardown hook. Hooks run in reverse registration
    /// order during `shutdown`.
    pub fn register<F>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.hooks.lock().expect("hooks lock").push((name.into(), Box::new(hook)));
    }

    /// Cancel the token and run every hook. A panicking hook is isolated
    /// and does not stop the rest of the teardown.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let hooks: Vec<(String, Hook)> = {
            let mut guard = self.hooks.lock().expect("hooks lock");
            guard.drain(..).collect()
        };
        for (name, hook) in hooks.into_iter().rev() {
            tracing::info!(hook = %name, "running teardown hook");
            let fut = std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook));
            match fut {
                Ok(fut) => {
                    if let Err(e) =
                        tokio::spawn(async move { fut.await }).await
                    {
                        tracing::warn!(hook = %name, error = %e, "teardown hook failed");
                    }
                }
                Err(_) => tracing::warn!(hook = %name, "teardown hook panicked"),
            }
        }
        tracing::info!("shutdown complete");
    }

    /// Spawn a background task that listens for OS signals and triggers
    /// cancellation. Teardown itself stays with the owner.
    pub fn spawn_signal_listener(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            let ctrl_c = signal::ctrl_c();
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {
                            tracing::info!("received SIGINT, initiating shutdown");
                        },
                        _ = sigterm.recv() => {
                            tracing::info!("received SIGTERM, initiating shutdown");
                        },
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler, listening for SIGINT only");
                    let _ = ctrl_c.await;
                    tracing::info!("received SIGINT, initiating shutdown");
                }
            }
            token.cancel();
        });
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
