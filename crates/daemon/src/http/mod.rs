//! HTTP transport.
//!
//! Maps the terminal endpoints onto the session registry and input gateway:
//!
//! ```text
//! POST   /terminals               create a session
//! GET    /terminals               list sessions
//! GET    /terminals/:id           session snapshot
//! DELETE /terminals/:id           terminate a session
//! POST   /terminals/:id/data      send raw input
//! GET    /terminals/:id/data      stream raw output
//! POST   /terminals/:id/size      resize the terminal
//! GET    /health                  liveness
//! ```
//!
//! Unmatched paths are served from the static asset directory when one is
//! configured.

mod error;
mod handlers;

use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::SessionConfig;
use crate::session::{InputGateway, SessionRegistry};

pub use error::{ApiError, ApiResult};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session registry.
    pub registry: Arc<SessionRegistry>,
    /// Input validation and routing.
    pub gateway: InputGateway,
    /// Defaults for newly created sessions.
    pub session_defaults: Arc<SessionConfig>,
}

impl AppState {
    /// Creates handler state around `registry`.
    pub fn new(
        registry: Arc<SessionRegistry>,
        gateway: InputGateway,
        session_defaults: SessionConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            session_defaults: Arc::new(session_defaults),
        }
    }
}

/// Builds the application router.
pub fn router(state: AppState, static_dir: Option<&Path>) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/terminals",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/terminals/:id",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/terminals/:id/data",
            get(handlers::stream_output).post(handlers::send_input),
        )
        .route("/terminals/:id/size", post(handlers::resize_session));

    if let Some(dir) = static_dir {
        tracing::debug!(dir = %dir.display(), "Serving static assets");
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
