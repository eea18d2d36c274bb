//! Input gateway.
//!
//! Validates client input and routes it to the addressed session's shell.

use std::sync::Arc;

use bytes::Bytes;
use webterm_protocol::SessionId;

use super::pty::SessionError;
use super::registry::SessionRegistry;

/// Default maximum size of a single input payload.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 64 * 1024;

/// Routes input payloads to sessions.
#[derive(Clone)]
pub struct InputGateway {
    registry: Arc<SessionRegistry>,
    max_payload: usize,
    require_utf8: bool,
}

impl InputGateway {
    /// Creates a gateway in front of `registry`.
    pub fn new(registry: Arc<SessionRegistry>, max_payload: usize, require_utf8: bool) -> Self {
        Self {
            registry,
            max_payload,
            require_utf8,
        }
    }

    /// Checks a payload without delivering it.
    pub fn validate(&self, payload: &[u8]) -> Result<(), SessionError> {
        if payload.is_empty() {
            return Err(SessionError::InvalidPayload("payload is empty".to_string()));
        }
        if payload.len() > self.max_payload {
            return Err(SessionError::InvalidPayload(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_payload
            )));
        }
        if self.require_utf8 {
            if let Err(e) = std::str::from_utf8(payload) {
                return Err(SessionError::InvalidPayload(format!(
                    "payload is not valid UTF-8: {}",
                    e
                )));
            }
        }
        Ok(())
    }

    /// Delivers `payload` to the session named by `raw_id`.
    ///
    /// Bytes reach the shell unmodified and in the order accepted.
    pub async fn send(&self, raw_id: &str, payload: Bytes) -> Result<(), SessionError> {
        let id = SessionId::parse(raw_id)?;
        self.validate(&payload)?;

        let session = self.registry.lookup(&id)?;
        session.write(&payload).await?;

        tracing::trace!(session_id = %id, bytes = payload.len(), "Input delivered");
        Ok(())
    }
}
