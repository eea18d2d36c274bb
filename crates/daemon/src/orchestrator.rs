//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! registry and input gateway, serves the HTTP transport, and tears every
//! session down on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::http::{self, AppState};
use crate::session::{InputGateway, RegistryConfig, SessionRegistry};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The HTTP server is accepting connections.
    Listening(SocketAddr),
    /// Sessions were terminated during shutdown.
    SessionsTerminated(usize),
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Registry of live sessions.
    registry: Arc<SessionRegistry>,
    /// Handler state shared by every request.
    app_state: AppState,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::from_config(&config)));
        let gateway = InputGateway::new(
            Arc::clone(&registry),
            config.stream.max_input_bytes,
            config.stream.require_utf8,
        );
        let app_state = AppState::new(Arc::clone(&registry), gateway, config.session.clone());

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            app_state,
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Builds the HTTP router.
    pub fn router(&self) -> Router {
        http::router(
            self.app_state.clone(),
            self.config.server.static_dir.as_deref(),
        )
    }

    /// Binds the configured listening address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_addr()?;
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Serves HTTP on `listener` until [`stop`](Self::stop) is called.
    ///
    /// On shutdown every session is terminated first, which ends all
    /// streaming responses, then in-flight requests drain.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let idle_timeout = self.config.session.idle_timeout_secs;
        let sweep_task = (idle_timeout > 0).then(|| {
            debug!(idle_timeout_secs = idle_timeout, "Started idle session sweep");
            self.registry.start_sweep_task(
                Duration::from_secs(self.config.session.sweep_interval_secs),
                Duration::from_secs(idle_timeout),
                self.shutdown_token.clone(),
            )
        });

        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;

        self.set_state(OrchestratorState::Running).await;
        self.emit_event(OrchestratorEvent::Listening(local_addr));
        info!(addr = %local_addr, "webterm listening");

        let token = self.shutdown_token.clone();
        let registry = Arc::clone(&self.registry);
        let event_tx = self.event_tx.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                let terminated = registry.shutdown();
                let _ = event_tx.send(OrchestratorEvent::SessionsTerminated(terminated));
            })
            .await
            .context("HTTP server error");

        // The server may have failed without a shutdown request.
        self.shutdown_token.cancel();
        self.registry.shutdown();
        if let Some(task) = sweep_task {
            let _ = task.await;
        }

        self.set_state(OrchestratorState::Stopped).await;
        info!("Daemon orchestrator stopped");
        result
    }

    /// Requests a graceful shutdown of a running daemon.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::ShuttingDown => {
                    anyhow::bail!("Orchestrator is already shutting down")
                }
                _ => *state = OrchestratorState::ShuttingDown,
            }
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();
        Ok(())
    }

    async fn set_state(&self, next: OrchestratorState) {
        *self.state.write().await = next;
        self.emit_event(OrchestratorEvent::StateChanged(next));
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
