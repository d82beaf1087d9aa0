//! Provider lifecycle orchestration.
//!
//! Starts providers in topological order with a per-start timeout,
//! health-checks each after start, and performs full rollback when a start
//! fails. Shutdown flushes every flushable provider, then stops in exact
//! reverse of the order that actually started, each stop bounded by a cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use nimbus_core::{EmulatorError, Provider};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the lifecycle of a set of providers.
pub struct Orchestrator {
    providers: Mutex<HashMap<String, Arc<dyn Provider>>>,
    startup_order: Mutex<Vec<String>>,
    /// Node ids that actually started, in start order.
    started: Mutex<Vec<String>>,
    running: AtomicBool,
    shutdown: CancellationToken,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            startup_order: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, start_timeout: Duration, stop_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self.stop_timeout = stop_timeout;
        self
    }

    /// Start all providers in `startup_order`. On any failure the already-
    /// started providers are stopped in reverse and the error propagates.
    pub async fn start(
        &self,
        providers: HashMap<String, Arc<dyn Provider>>,
        startup_order: Vec<String>,
    ) -> Result<(), EmulatorError> {
        *self.providers.lock().expect("providers lock") = providers;
        *self.startup_order.lock().expect("order lock") = startup_order.clone();

        for node_id in &startup_order {
            let provider = {
                let providers = self.providers.lock().expect("providers lock");
                providers.get(node_id).cloned()
            };
            let Some(provider) = provider else {
                continue;
            };

            tracing::info!(provider = provider.name(), "starting provider");
            let start = tokio::time::timeout(self.start_timeout, provider.start()).await;
            let failure = match start {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!(
                    "start timed out after {:?}",
                    self.start_timeout
                )),
            };
            if let Some(cause) = failure {
                tracing::error!(provider = provider.name(), %cause, "failed to start");
                self.stop().await;
                return Err(EmulatorError::ProviderStart(format!(
                    "provider {} failed to start: {cause}",
                    provider.name()
                )));
            }
            self.started
                .lock()
                .expect("started lock")
                .push(node_id.clone());

            if !provider.health_check().await {
                tracing::warn!(
                    provider = provider.name(),
                    "provider started but health check failed"
                );
            }
            tracing::info!(provider = provider.name(), "provider started");
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!("all providers started");
        Ok(())
    }

    /// Stop all started providers in reverse startup order, flushing first.
    pub async fn stop(&self) {
        let started: Vec<String> = {
            let mut guard = self.started.lock().expect("started lock");
            guard.drain(..).collect()
        };
        if started.is_empty() {
            self.running.store(false, Ordering::SeqCst);
            return;
        }

        tracing::info!("shutting down providers");
        self.flush_providers(&started).await;

        for node_id in started.iter().rev() {
            let provider = {
                let providers = self.providers.lock().expect("providers lock");
                providers.get(node_id).cloned()
            };
            let Some(provider) = provider else {
                continue;
            };
            tracing::info!(provider = provider.name(), "stopping provider");
            match tokio::time::timeout(self.stop_timeout, provider.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(provider = provider.name(), error = %err, "error stopping provider");
                }
                Err(_) => {
                    tracing::warn!(
                        provider = provider.name(),
                        "timed out stopping provider, skipping"
                    );
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.providers.lock().expect("providers lock").clear();
        self.startup_order.lock().expect("order lock").clear();
        tracing::info!("all providers stopped");
    }

    async fn flush_providers(&self, started: &[String]) {
        for node_id in started {
            let provider = {
                let providers = self.providers.lock().expect("providers lock");
                providers.get(node_id).cloned()
            };
            let Some(provider) = provider else {
                continue;
            };
            if !provider.supports_flush() {
                continue;
            }
            tracing::info!(provider = provider.name(), "flushing provider state");
            if let Err(err) = provider.flush().await {
                tracing::error!(provider = provider.name(), error = %err, "error flushing provider");
            }
        }
    }

    /// Trigger graceful shutdown programmatically.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Block until shutdown is requested.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the managed providers, in startup order.
    pub fn providers(&self) -> Vec<(String, Arc<dyn Provider>)> {
        let providers = self.providers.lock().expect("providers lock");
        let order = self.startup_order.lock().expect("order lock");
        order
            .iter()
            .filter_map(|id| providers.get(id).map(|p| (id.clone(), p.clone())))
            .collect()
    }
}
