//! HTTP request handlers.

use std::convert::Infallible;
use std::path::PathBuf;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use webterm_protocol::{
    CreateSessionRequest, CreateSessionResponse, HealthResponse, ResizeRequest, SessionId,
    SessionSummary, API_VERSION,
};

use super::error::{ApiError, ApiResult};
use super::AppState;

/// Parses an optional JSON body. An empty body yields the default value.
fn parse_json<T: DeserializeOwned + Default>(body: &[u8]) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn validate_size(cols: u16, rows: u16) -> ApiResult<()> {
    if cols == 0 || rows == 0 {
        return Err(ApiError::BadRequest(format!(
            "terminal size must be at least 1x1, got {}x{}",
            cols, rows
        )));
    }
    Ok(())
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: API_VERSION,
        sessions: state.registry.count(),
    })
}

/// `POST /terminals`
pub(super) async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<CreateSessionResponse>> {
    let request: CreateSessionRequest = parse_json(&body)?;

    let mut params = state.session_defaults.spawn_params();
    let cols = request.cols.unwrap_or(params.size.cols);
    let rows = request.rows.unwrap_or(params.size.rows);
    validate_size(cols, rows)?;
    params = params.with_size(cols, rows);
    if let Some(cwd) = request.cwd {
        params.cwd = PathBuf::from(cwd);
    }

    let id = state.registry.create(params).await?;
    Ok(Json(CreateSessionResponse { id }))
}

/// `GET /terminals`
pub(super) async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list())
}

/// `GET /terminals/:id`
pub(super) async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    let id = SessionId::parse(&id)?;
    let session = state.registry.lookup(&id)?;
    Ok(Json(session.summary()))
}

/// `POST /terminals/:id/data`
///
/// The body is delivered to the shell verbatim.
pub(super) async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state.gateway.send(&id, body).await?;
    Ok(StatusCode::OK)
}

/// `GET /terminals/:id/data`
///
/// Streams raw terminal output until the shell exits or the client
/// disconnects. Only output produced after the request arrives is sent.
pub(super) async fn stream_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = SessionId::parse(&id)?;
    let subscription = state.registry.attach(&id)?;

    tracing::debug!(
        session_id = %id,
        consumer_id = subscription.id(),
        "Streaming session output"
    );

    let stream = subscription.into_stream().map(Ok::<_, Infallible>);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// `POST /terminals/:id/size`
pub(super) async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let id = SessionId::parse(&id)?;
    let request: ResizeRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    validate_size(request.cols, request.rows)?;

    state.registry.resize(&id, request.cols, request.rows)?;
    Ok(StatusCode::OK)
}

/// `DELETE /terminals/:id`
///
/// Succeeds whether or not the session still exists.
pub(super) async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = SessionId::parse(&id)?;
    if !state.registry.remove(&id) {
        tracing::debug!(session_id = %id, "Delete of unknown session");
    }
    Ok(StatusCode::NO_CONTENT)
}
