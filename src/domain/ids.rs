//! Type-safe identifiers for sessions, requests and subscribers.
//!
//! [`SessionKey`] names a notebook document and is chosen by the client.
//! [`RequestId`] correlates one execute request with every reply and
//! broadcast the kernel emits for it. [`SubscriberId`] tags one client
//! connection inside a session's fan-out set.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Maximum accepted length of a session key, in bytes.
pub const MAX_SESSION_KEY_LEN: usize = 512;

/// Stable identity of a notebook session.
///
/// Used as the dictionary key in [`crate::service::SessionRegistry`] and as
/// the routing target of client actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey(String);

impl SessionKey {
    /// Validates and wraps a session key.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the key is empty, longer
    /// than [`MAX_SESSION_KEY_LEN`], or contains control characters.
    pub fn new(key: impl Into<String>) -> Result<Self, GatewayError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "session key must not be empty".to_string(),
            ));
        }
        if key.len() > MAX_SESSION_KEY_LEN {
            return Err(GatewayError::InvalidRequest(format!(
                "session key exceeds {MAX_SESSION_KEY_LEN} bytes"
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(GatewayError::InvalidRequest(
                "session key must not contain control characters".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionKey {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}

/// Identifier of one execute request.
///
/// Either supplied by the client or generated as a UUID v4. The same value
/// is used as the kernel message id, so the kernel echoes it back in
/// `parent_header.msg_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Creates a new random request id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps a caller-chosen request id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the id is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, GatewayError> {
        let id = id.into();
        if id.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "request id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one client connection's subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(uuid::Uuid);

impl SubscriberId {
    /// Creates a new random subscriber id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
