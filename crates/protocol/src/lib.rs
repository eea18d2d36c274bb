//! # webterm Protocol Library
//!
//! Wire types shared by the webterm daemon and its HTTP clients.
//!
//! ## Overview
//!
//! The daemon speaks plain HTTP. Terminal bytes travel as raw bodies:
//!
//! ```text
//! POST /terminals              -> {"id": "<token>"}
//! POST /terminals/:id/data     <- raw input bytes
//! GET  /terminals/:id/data     -> chunked raw output until the shell exits
//! ```
//!
//! This crate defines the JSON bodies used around those streams and the
//! [`SessionId`] token that names a session.
//!
//! ## Example Usage
//!
//! ```rust
//! use webterm_protocol::{CreateSessionResponse, SessionId};
//!
//! let id = SessionId::generate();
//! let body = serde_json::to_string(&CreateSessionResponse { id: id.clone() }).unwrap();
//! assert!(body.contains(id.as_str()));
//!
//! assert!(SessionId::parse("not a token").is_err());
//! ```
//!
//! ## Modules
//!
//! - [`id`]: Session identifiers
//! - [`messages`]: Request and response bodies
//! - [`error`]: Error types

pub mod error;
pub mod id;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use id::{SessionId, MAX_SESSION_ID_LEN};
pub use messages::{
    CreateSessionRequest, CreateSessionResponse, ErrorBody, ErrorDetail, HealthResponse,
    ResizeRequest, SessionState, SessionSummary, API_VERSION,
};
