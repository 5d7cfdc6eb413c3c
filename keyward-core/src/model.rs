//! Domain model types for Keyward.
//!
//! This module defines the identifiers used throughout Keyward:
//! - [`ServiceId`] - Identifier for a remote service (e.g., "twitter", "google")
//! - [`OwnerId`] - Identifier for the host user a connection belongs to
//! - [`TokenId`] - Storage-assigned identifier for a persisted token
//! - [`TokenKind`] - Request (handshake) or access (long-lived) token
//! - [`Action`] - Inbound actions the orchestrator dispatches

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier for a service (e.g., "twitter", "google", "pinboard").
///
/// Service IDs should be lowercase and use hyphens for multi-word names.
///
/// # Examples
///
/// ```
/// use keyward_core::ServiceId;
///
/// let twitter = ServiceId::new("Twitter");
/// assert_eq!(twitter.as_str(), "twitter");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a new service ID.
    ///
    /// The ID is normalized to lowercase.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase())
    }

    /// Get the service ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Identifier for the host-side user that owns a connection.
///
/// Owners let one store hold connections for many users of the host
/// application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create a new owner ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the owner ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Storage-assigned identifier of a persisted token.
///
/// For OAuth2 handshakes the request token's ID doubles as the `state`
/// parameter, so it must survive a round trip through a URL unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(String);

impl TokenId {
    /// Create a token ID from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the token ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<u64> for TokenId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Kind of token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Short-lived token that only correlates the start and end of a handshake.
    Request,

    /// Long-lived credential used to call protected resources.
    Access,
}

impl TokenKind {
    /// Get the token kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Access => "access",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inbound action dispatched by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Start a handshake.
    Request,

    /// Complete a handshake from the provider callback.
    Verify,

    /// Report a freshly created connection.
    Created,

    /// Delete a connection.
    Delete,

    /// List the connections of a service.
    Manage,
}

impl Action {
    /// Get the action as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Verify => "verify",
            Self::Created => "created",
            Self::Delete => "delete",
            Self::Manage => "manage",
        }
    }

    /// Nonce action guarding this inbound action at the orchestrator level.
    pub fn nonce_action(&self) -> String {
        format!("keyring-{}", self.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(Self::Request),
            "verify" => Ok(Self::Verify),
            "created" => Ok(Self::Created),
            "delete" => Ok(Self::Delete),
            "manage" => Ok(Self::Manage),
            other => Err(ParseError::UnknownAction {
                action: other.to_string(),
            }),
        }
    }
}

/// Nonce action for the per-service request step.
pub fn request_nonce_action(service: &ServiceId) -> String {
    format!("keyring-request-{}", service)
}

/// Nonce action for the per-service verify step.
pub fn verify_nonce_action(service: &ServiceId) -> String {
    format!("keyring-verify-{}", service)
}

/// Error parsing a model value.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown action: {action}")]
    UnknownAction { action: String },
}
