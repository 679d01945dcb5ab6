//! Session and resource identifiers.
//!
//! Every identifier handed to a client is a random v4 UUID, so a handle is
//! never reused within the lifetime of its owning session.

use std::fmt;

use uuid::Uuid;

use crate::error::ServerError;

/// Unique identifier for a client session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from existing string (for deserialization)
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

macro_rules! define_id_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse the textual form sent by a client
            pub fn parse(raw: &str) -> Result<Self, ServerError> {
                Uuid::parse_str(raw.trim()).map(Self).map_err(|err| {
                    ServerError::InvalidRequest(format!(
                        concat!("malformed ", stringify!($name), " {:?}: {}"),
                        raw, err
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id_type!(
    ResourceId,
    "Handle of a statement, result set, LOB or attribute registered under a session"
);
define_id_type!(TransactionId, "Transaction handle reported in the session shell");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_conversions_and_formatting_work() {
        let custom = SessionId::from_string("session-123".to_string());
        assert_eq!(custom.as_ref(), "session-123");
        assert_eq!(custom.to_string(), "session-123");

        let from_impl: SessionId = "other-session".to_string().into();
        assert_eq!(from_impl.as_ref(), "other-session");

        let generated = SessionId::new();
        assert!(Uuid::parse_str(generated.as_ref()).is_ok());
    }

    #[test]
    fn resource_ids_parse_their_own_display_form() {
        let id = ResourceId::new();
        let parsed = ResourceId::parse(&id.to_string());
        assert_eq!(parsed.ok(), Some(id));
        assert_ne!(ResourceId::new(), ResourceId::new());
    }

    #[test]
    fn malformed_ids_are_invalid_requests() {
        assert!(matches!(
            ResourceId::parse("nope"),
            Err(ServerError::InvalidRequest(_))
        ));
        assert!(TransactionId::parse("").is_err());
    }
}
