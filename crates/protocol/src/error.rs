//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering wire-level failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A session identifier did not have the expected shape.
    #[error("invalid session id {id:?}: {reason}")]
    InvalidSessionId {
        /// The rejected identifier, as received.
        id: String,
        /// Why the identifier was rejected.
        reason: &'static str,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
