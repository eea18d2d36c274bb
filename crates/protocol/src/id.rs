//! Session identifiers.
//!
//! Identifiers are opaque tokens generated by the daemon. They are never
//! derived from the OS process id, so a recycled pid can't alias a live
//! session.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Maximum accepted length of a session identifier.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Opaque, client-visible session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parses an identifier received from a client.
    ///
    /// Well-formed identifiers are 1 to [`MAX_SESSION_ID_LEN`] characters of
    /// ASCII letters, digits, `-` or `_`. Well-formedness says nothing about
    /// whether the session exists.
    pub fn parse(raw: &str) -> Result<Self> {
        let reason = if raw.is_empty() {
            Some("must not be empty")
        } else if raw.len() > MAX_SESSION_ID_LEN {
            Some("is too long")
        } else if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            Some("contains a disallowed character")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ProtocolError::InvalidSessionId {
                id: raw.to_string(),
                reason,
            }),
            None => Ok(Self(raw.to_string())),
        }
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_is_well_formed() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 36);
        assert_eq!(SessionId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_generate_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_parse_short_token() {
        // Unknown but well-formed: lookups decide whether it exists.
        assert!(SessionId::parse("zzz").is_ok());
        assert!(SessionId::parse("abc_DEF-123").is_ok());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(
            SessionId::parse(""),
            Err(ProtocolError::InvalidSessionId { reason: "must not be empty", .. })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_characters() {
        for raw in ["a b", "../etc", "id%00", "ünïcode", "a/b"] {
            assert!(SessionId::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn test_parse_length_boundary() {
        let max = "a".repeat(MAX_SESSION_ID_LEN);
        assert!(SessionId::parse(&max).is_ok());
        let over = "a".repeat(MAX_SESSION_ID_LEN + 1);
        assert!(SessionId::parse(&over).is_err());
    }

    #[test]
    fn test_serde_transparent_string() {
        let id = SessionId::parse("abc-123").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc-123\"");

        let bad: std::result::Result<SessionId, _> = serde_json::from_str("\"a b\"");
        assert!(bad.is_err());
    }
}
