//! Runtime assembly: orchestration, binding, and serving.
//!
//! The binary loads a cloud assembly, builds the graph, binds providers,
//! and launches an [`Emulator`]: providers started in topological order,
//! pollers activated after them, one HTTP listener per service surface, and
//! the management API on the primary port.

pub mod binder;
pub mod management;
pub mod orchestrator;
pub mod ports;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use nimbus_core::{EmulatorConfig, EmulatorError};
use nimbus_providers::QueuePoller;

pub use binder::{bind, BoundApplication};
pub use management::{management_router, ManagementState};
pub use orchestrator::Orchestrator;

/// A running emulator instance.
pub struct Emulator {
    orchestrator: Arc<Orchestrator>,
    pollers: Vec<Arc<QueuePoller>>,
    servers: Vec<JoinHandle<()>>,
}

impl Emulator {
    /// Start providers, activate wiring, and bind every HTTP surface.
    /// Any failure rolls the started providers back.
    pub async fn launch(
        app: BoundApplication,
        config: &EmulatorConfig,
    ) -> Result<Self, EmulatorError> {
        let orchestrator = Arc::new(Orchestrator::new());
        orchestrator
            .start(app.providers, app.startup_order)
            .await?;

        // Pollers hold non-owning references into providers; they start
        // after everything is up and stop before anything goes down.
        for poller in &app.pollers {
            poller.start();
        }

        let management_state = Arc::new(ManagementState {
            orchestrator: orchestrator.clone(),
            invokers: app.invokers,
            resources: app.resources,
        });
        let mut bindings = vec![(config.port, management_router(management_state))];
        bindings.extend(app.surfaces);

        let mut servers: Vec<JoinHandle<()>> = Vec::with_capacity(bindings.len());
        for (port, router) in bindings {
            let listener = match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    for poller in &app.pollers {
                        poller.stop().await;
                    }
                    orchestrator.stop().await;
                    for server in servers {
                        server.abort();
                    }
                    return Err(EmulatorError::ProviderStart(format!(
                        "cannot bind port {port}: {err}"
                    )));
                }
            };
            tracing::info!(port, "listening");
            let app_router = router.layer(TraceLayer::new_for_http());
            servers.push(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app_router).await {
                    tracing::error!(port, error = %err, "server exited");
                }
            }));
        }

        Ok(Self {
            orchestrator,
            pollers: app.pollers,
            servers,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn request_shutdown(&self) {
        self.orchestrator.request_shutdown();
    }

    pub async fn wait_for_shutdown(&self) {
        self.orchestrator.wait_for_shutdown().await;
    }

    /// Graceful teardown: pollers first, then providers (with flush), then
    /// the listeners.
    pub async fn shutdown(self) {
        for poller in &self.pollers {
            poller.stop().await;
        }
        self.orchestrator.stop().await;
        for server in self.servers {
            server.abort();
        }
    }
}
