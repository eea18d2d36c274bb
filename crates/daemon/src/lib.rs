//! # webterm Daemon Library
//!
//! This crate provides the daemon that serves interactive shell sessions
//! over plain HTTP.
//!
//! ## Overview
//!
//! Each session is a shell running on its own pseudo-terminal. Clients:
//!
//! - **Create** a session and receive an opaque identifier
//! - **Send input** as raw request bodies
//! - **Stream output** as a chunked response that ends when the shell exits
//!
//! Any number of clients may stream the same session. A slow client loses
//! its oldest buffered output rather than stalling the others.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                    │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │                 HTTP Transport (axum)              │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌───────────────┐  ┌──────────────────────────────────┐ │
//! │  │ Input Gateway │  │        Session Registry          │ │
//! │  └───────────────┘  └──────────────────────────────────┘ │
//! │  ┌───────────────┐  ┌──────────────────────────────────┐ │
//! │  │Process Handle │─▶│       Output Broadcaster         │ │
//! │  └───────────────┘  └──────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webterm_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let orchestrator = DaemonOrchestrator::new(config)?;
//!     let listener = orchestrator.bind().await?;
//!
//!     // Serves until `orchestrator.stop()` is called from another task.
//!     orchestrator.run(listener).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes, output fan-out, the registry and input routing
//! - [`http`]: HTTP endpoints
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod http;
pub mod orchestrator;
pub mod session;

// Re-export protocol for convenience
pub use webterm_protocol as protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    InputGateway, OutputBroadcaster, ProcessHandle, Session, SessionError, SessionRegistry,
    SessionStatus, SpawnParams, Subscription,
};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
