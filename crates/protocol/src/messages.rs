//! HTTP message bodies for webterm.
//!
//! Input and output bytes travel as raw request/response bodies; only the
//! control endpoints (create, resize, listing, errors) carry JSON.

use serde::{Deserialize, Serialize};

use crate::id::SessionId;

/// Current API version, reported by the health endpoint.
pub const API_VERSION: u8 = 1;

// ============================================================================
// Session Messages
// ============================================================================

/// Optional body of `POST /terminals`.
///
/// Every field falls back to the daemon's configured default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSessionRequest {
    /// Requested terminal columns.
    pub cols: Option<u16>,
    /// Requested terminal rows.
    pub rows: Option<u16>,
    /// Working directory for the shell.
    pub cwd: Option<String>,
}

/// Response to `POST /terminals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// Identifier to use on the data endpoints.
    pub id: SessionId,
}

/// Body of `POST /terminals/:id/size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Lifecycle state of a session as reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Process is being spawned.
    Starting,
    /// Process is running and accepting input.
    Running,
    /// Process has terminated.
    Exited,
}

/// Snapshot of a session, returned by the listing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Current lifecycle state.
    pub state: SessionState,
    /// OS process id of the shell, when known.
    pub pid: Option<u32>,
    /// Shell command the session was spawned with.
    pub shell: String,
    /// Working directory the session was spawned in.
    pub cwd: String,
    /// Terminal columns.
    pub cols: u16,
    /// Terminal rows.
    pub rows: u16,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: u64,
    /// Last input or output, Unix epoch milliseconds.
    pub last_activity: u64,
    /// Number of attached output consumers.
    pub consumers: usize,
    /// Exit code, once the process has exited.
    pub exit_code: Option<u32>,
}

// ============================================================================
// Control Messages
// ============================================================================

/// Response of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the daemon answers.
    pub status: String,
    /// API version.
    pub version: u8,
    /// Number of registered sessions.
    pub sessions: usize,
}

/// JSON error envelope returned with every non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error details.
    pub error: ErrorDetail,
}

/// Machine- and human-readable error description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error kind, e.g. `session_not_found`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorBody {
    /// Creates a new error body.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_empty_object() {
        let req: CreateSessionRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req, CreateSessionRequest::default());
    }

    #[test]
    fn test_create_request_partial() {
        let req: CreateSessionRequest =
            serde_json::from_str(r#"{"cols": 120, "cwd": "/tmp"}"#).unwrap();
        assert_eq!(req.cols, Some(120));
        assert_eq!(req.rows, None);
        assert_eq!(req.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn test_create_response_shape() {
        let resp = CreateSessionResponse {
            id: SessionId::parse("abc-123").unwrap(),
        };
        assert_eq!(serde_json::to_string(&resp).unwrap(), r#"{"id":"abc-123"}"#);
    }

    #[test]
    fn test_create_response_rejects_malformed_id() {
        let res: Result<CreateSessionResponse, _> = serde_json::from_str(r#"{"id":"a b"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_session_state_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionState::Running).unwrap(),
            "\"running\""
        );
        let state: SessionState = serde_json::from_str("\"exited\"").unwrap();
        assert_eq!(state, SessionState::Exited);
    }

    #[test]
    fn test_error_body_type_field() {
        let body = ErrorBody::new("session_not_found", "session not found: zzz");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["type"], "session_not_found");
        assert_eq!(json["error"]["message"], "session not found: zzz");
    }

    #[test]
    fn test_resize_request_requires_both_fields() {
        assert!(serde_json::from_str::<ResizeRequest>(r#"{"cols": 10}"#).is_err());
        let req: ResizeRequest = serde_json::from_str(r#"{"cols": 10, "rows": 5}"#).unwrap();
        assert_eq!(req, ResizeRequest { cols: 10, rows: 5 });
    }
}
