//! Token model.
//!
//! This module provides:
//! - [`Token`] - A request or access token with its credential and metadata
//! - [`Credential`] - Bearer secret or OAuth1 key/secret pair
//! - [`TokenMeta`] - Ordered string metadata with hidden (`_`-prefixed) keys
//!
//! Expiry lives in the `expires` metadata key as an absolute timestamp
//! (unix seconds, or RFC 3339). A token without `expires` never expires.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::model::{OwnerId, ServiceId, TokenId, TokenKind};
use crate::store::Secret;

/// Metadata key holding the absolute expiry timestamp.
pub const EXPIRES: &str = "expires";

/// Metadata key holding an OAuth2 refresh token.
pub const REFRESH_TOKEN: &str = "refresh_token";

/// Hidden metadata key recording which host feature asked for the connection.
pub const FOR: &str = "_for";

/// Prefix marking metadata keys as internal bookkeeping.
pub const HIDDEN_PREFIX: char = '_';

/// Error type for token operations.
#[derive(Debug, Error)]
pub enum TokenError {
    /// An `expires` value that is not an absolute timestamp.
    #[error("invalid expiry timestamp: {value}")]
    InvalidExpiry { value: String },
}

/// Credential material carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// A single secret: an OAuth2 bearer token or encoded Basic credentials.
    Bearer { token: Secret },

    /// An OAuth1 token and token secret.
    Pair { key: Secret, secret: Secret },
}

impl Credential {
    /// Create a bearer credential.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: Secret::new(token),
        }
    }

    /// Create a key/secret pair credential.
    pub fn pair(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::Pair {
            key: Secret::new(key),
            secret: Secret::new(secret),
        }
    }

    /// The bearer token, or the key of a pair.
    pub fn token(&self) -> &Secret {
        match self {
            Self::Bearer { token } => token,
            Self::Pair { key, .. } => key,
        }
    }

    /// The secret half of a pair.
    pub fn secret(&self) -> Option<&Secret> {
        match self {
            Self::Bearer { .. } => None,
            Self::Pair { secret, .. } => Some(secret),
        }
    }
}

/// Ordered string metadata attached to a token.
///
/// Keys starting with `_` are hidden: internal bookkeeping that
/// [`TokenMeta::visible`] leaves out.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenMeta(BTreeMap<String, String>);

impl TokenMeta {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries, hidden ones included.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over every entry, hidden ones included.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries whose keys are not hidden.
    pub fn visible(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter(|(k, _)| !is_hidden(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Every entry, hidden ones included.
    pub fn all(&self) -> BTreeMap<String, String> {
        self.0.clone()
    }
}

impl fmt::Debug for TokenMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.0 {
            if is_sensitive(key) {
                map.entry(key, &"[REDACTED]");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

impl FromIterator<(String, String)> for TokenMeta {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TokenMeta {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

fn is_hidden(key: &str) -> bool {
    key.starts_with(HIDDEN_PREFIX)
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("token") || key.contains("secret") || key.contains("password")
}

/// Parse an absolute expiry timestamp (unix seconds or RFC 3339).
pub fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return DateTime::from_timestamp(seconds, 0);
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A request or access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// The service this token belongs to.
    pub service: ServiceId,

    /// Request (handshake) or access (long-lived) token.
    pub kind: TokenKind,

    /// Credential material, if the provider has issued any yet.
    pub credential: Option<Credential>,

    /// Provider-specific attributes (user id, display name, expiry, ...).
    pub meta: TokenMeta,

    /// The host user this token belongs to.
    pub owner: Option<OwnerId>,

    /// Storage-assigned id; `None` until persisted.
    pub unique_id: Option<TokenId>,

    /// When the token was created.
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Create a request token for the start of a handshake.
    pub fn request(service: impl Into<ServiceId>) -> Self {
        Self {
            service: service.into(),
            kind: TokenKind::Request,
            credential: None,
            meta: TokenMeta::new(),
            owner: None,
            unique_id: None,
            created_at: Utc::now(),
        }
    }

    /// Create an access token carrying a credential.
    pub fn access(service: impl Into<ServiceId>, credential: Credential) -> Self {
        Self {
            service: service.into(),
            kind: TokenKind::Access,
            credential: Some(credential),
            meta: TokenMeta::new(),
            owner: None,
            unique_id: None,
            created_at: Utc::now(),
        }
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<Option<OwnerId>>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Set the storage id.
    pub fn with_id(mut self, id: impl Into<TokenId>) -> Self {
        self.unique_id = Some(id.into());
        self
    }

    /// Set the credential.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Add a metadata entry.
    ///
    /// An unparseable `expires` value is dropped with a warning; use
    /// [`set_meta`](Self::set_meta) to get the error instead.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if let Err(e) = self.set_meta(key.clone(), value) {
            tracing::warn!("Dropping metadata {} for {}: {}", key, self.service, e);
        }
        self
    }

    /// Set the absolute expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.meta.insert(EXPIRES, expires_at.timestamp().to_string());
        self
    }

    /// Set the expiry relative to now.
    pub fn with_expires_in(self, seconds: i64) -> Self {
        self.with_expiry(Utc::now() + Duration::seconds(seconds))
    }

    /// Set a metadata entry, validating `expires`.
    pub fn set_meta(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), TokenError> {
        let key = key.into();
        let value = value.into();
        if key == EXPIRES && parse_expiry(&value).is_none() {
            return Err(TokenError::InvalidExpiry { value });
        }
        self.meta.insert(key, value);
        Ok(())
    }

    /// Merge metadata entries, validating `expires`.
    pub fn merge_meta(&mut self, meta: TokenMeta) -> Result<(), TokenError> {
        for (key, value) in meta {
            self.set_meta(key, value)?;
        }
        Ok(())
    }

    /// Get a metadata value.
    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key)
    }

    /// Metadata as a map, optionally including hidden keys.
    pub fn meta(&self, include_hidden: bool) -> BTreeMap<String, String> {
        if include_hidden {
            self.meta.all()
        } else {
            self.meta.visible()
        }
    }

    /// The absolute expiry, if one is recorded and parseable.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.meta.get(EXPIRES).and_then(parse_expiry)
    }

    /// Check whether the token expires within `window` from now.
    ///
    /// True iff `now + window > expires`. Tokens without `expires` never
    /// expire; an unparseable `expires` counts as expired.
    pub fn is_expired(&self, window: Duration) -> bool {
        match self.meta.get(EXPIRES) {
            None => false,
            Some(raw) => match parse_expiry(raw) {
                Some(expires) => Utc::now() + window > expires,
                None => true,
            },
        }
    }

    /// The OAuth2 refresh token, if one is recorded.
    pub fn refresh_token(&self) -> Option<&str> {
        self.meta.get(REFRESH_TOKEN).filter(|v| !v.is_empty())
    }

    /// Whether this is a request token.
    pub fn is_request(&self) -> bool {
        self.kind == TokenKind::Request
    }

    /// Whether this is an access token.
    pub fn is_access(&self) -> bool {
        self.kind == TokenKind::Access
    }

    /// Whether two tokens describe the same connection: same kind, service,
    /// owner and credential.
    pub fn same_connection(&self, other: &Token) -> bool {
        self.kind == other.kind
            && self.service == other.service
            && self.owner == other.owner
            && self.credential.is_some()
            && self.credential == other.credential
    }
}
