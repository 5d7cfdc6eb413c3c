//! Storage abstractions.
//!
//! This module provides:
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging
//! - [`SecretStore`] - Trait for secret storage backends (app credentials, token material)
//! - [`TokenStore`] - Trait for durable token storage, scoped by [`TokenSelector`]
//! - [`MemorySecretStore`] / [`MemoryTokenStore`] - In-memory implementations
//! - [`FileTokenStore`] - JSON-file token rows with credentials kept in a [`SecretStore`]
//! - [`KeyringStore`] - OS keyring implementation (with `keyring-store` feature)
//! - [`create_secret_store`] - Helper to select a secret backend based on availability
//!
//! # Secret Key Convention
//!
//! Secret keys follow the pattern `keyward/{area}/{...}`, e.g.
//! `keyward/app/twitter/secret` or `keyward/tokens/17/key`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::model::{OwnerId, ServiceId, TokenId, TokenKind};
use crate::token::Token;

mod file;
mod memory;
#[cfg(feature = "keyring-store")]
mod keyring;

pub use file::FileTokenStore;
pub use memory::{MemorySecretStore, MemoryTokenStore};
#[cfg(feature = "keyring-store")]
pub use keyring::KeyringStore;

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose).
/// Debug and Display implementations show `[REDACTED]` instead of the value,
/// and the buffer is zeroed when the secret is dropped.
#[derive(Clone, Serialize, Deserialize)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the inner value.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }

    /// Whether the secret holds an empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record was not found.
    #[error("record not found: {key}")]
    NotFound { key: String },

    /// An update was attempted on a token that was never persisted.
    #[error("token for {service} has no unique id; insert it first")]
    MissingId { service: String },

    /// A delete was attempted without any selector field set.
    #[error("refusing to delete with an empty selector")]
    UnscopedDelete,

    /// The storage backend encountered an error.
    #[error("backend error: {message}")]
    BackendError { message: String },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error reading or writing a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The keyring backend is not available.
    #[error("keyring not available: {message}")]
    KeyringUnavailable { message: String },

    /// Platform data directory not available.
    #[error("data directory not available")]
    DataDirUnavailable,
}

/// Abstraction over secret storage backends.
///
/// Implementations include:
/// - [`MemorySecretStore`] - In-memory storage for testing
/// - [`KeyringStore`] (with `keyring-store` feature) - OS keyring
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Retrieve a secret by key.
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError>;

    /// Store a secret at the given key.
    ///
    /// Overwrites any existing value.
    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError>;

    /// Delete a secret by key.
    ///
    /// Returns `Ok(())` even if the key didn't exist.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List all keys matching a prefix.
    ///
    /// Returns an empty vec if no keys match.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Check if a key exists without retrieving the value.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Whether secrets survive a process restart.
    fn is_persistent(&self) -> bool {
        true
    }
}

#[async_trait]
impl<T: SecretStore + ?Sized> SecretStore for Box<T> {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        (**self).set(key, secret).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).list_keys(prefix).await
    }

    fn is_persistent(&self) -> bool {
        (**self).is_persistent()
    }
}

#[async_trait]
impl<T: SecretStore + ?Sized> SecretStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        (**self).set(key, secret).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).list_keys(prefix).await
    }

    fn is_persistent(&self) -> bool {
        (**self).is_persistent()
    }
}

/// Filter used to address tokens in a [`TokenStore`].
///
/// Every field that is set must match; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSelector {
    /// Exact storage id.
    pub id: Option<TokenId>,

    /// Token kind.
    pub kind: Option<TokenKind>,

    /// Owning service.
    pub service: Option<ServiceId>,

    /// Owning host user.
    pub owner: Option<OwnerId>,
}

impl TokenSelector {
    /// Create a selector that matches every token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a single token by id.
    pub fn by_id(id: impl Into<TokenId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Restrict to an id.
    pub fn id(mut self, id: impl Into<TokenId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Restrict to a token kind.
    pub fn kind(mut self, kind: TokenKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restrict to a service.
    pub fn service(mut self, service: impl Into<ServiceId>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Restrict to an owner, if one is given.
    pub fn owner(mut self, owner: Option<OwnerId>) -> Self {
        self.owner = owner;
        self
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.kind.is_none() && self.service.is_none() && self.owner.is_none()
    }

    /// Check whether a token matches this selector.
    pub fn matches(&self, token: &Token) -> bool {
        if let Some(id) = &self.id {
            if token.unique_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if token.kind != kind {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if &token.service != service {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if token.owner.as_ref() != Some(owner) {
                return false;
            }
        }
        true
    }
}

/// Durable keyed storage for request and access tokens.
///
/// Implementations must make `insert`, `update` and `delete` atomic with
/// respect to a single token row, and `insert` must be durable before it
/// returns: a handshake redirects the user agent right after inserting its
/// request token.
///
/// Access-token inserts are deduplicated: when an access token with the same
/// service, owner and credential already exists, it is updated in place and
/// its id is returned.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a new token and return its assigned id.
    async fn insert(&self, token: &Token) -> Result<TokenId, StoreError>;

    /// Replace a persisted token, addressed by its `unique_id`.
    async fn update(&self, token: &Token) -> Result<TokenId, StoreError>;

    /// Delete every token matching the selector.
    ///
    /// Returns whether anything was deleted.
    async fn delete(&self, selector: &TokenSelector) -> Result<bool, StoreError>;

    /// Fetch all tokens matching the selector, in id order.
    async fn get_tokens(&self, selector: &TokenSelector) -> Result<Vec<Token>, StoreError>;

    /// Fetch the first token matching the selector.
    async fn get_token(&self, selector: &TokenSelector) -> Result<Option<Token>, StoreError> {
        Ok(self.get_tokens(selector).await?.into_iter().next())
    }

    /// Count tokens matching the selector.
    async fn count(&self, selector: &TokenSelector) -> Result<usize, StoreError> {
        Ok(self.get_tokens(selector).await?.len())
    }
}

/// Create a secret store with automatic backend selection.
///
/// # Backend Selection Logic
///
/// - If `prefer_keyring` is `true` and the `keyring-store` feature is enabled:
///   - Attempts to create a [`KeyringStore`]
///   - Falls back to [`MemorySecretStore`] with a warning if keyring is unavailable
/// - Otherwise: Returns [`MemorySecretStore`]
///
/// # Example
///
/// ```rust,ignore
/// use keyward_core::store::create_secret_store;
///
/// // Try to use keyring, fallback to memory if unavailable
/// let secrets = create_secret_store(true);
/// ```
pub fn create_secret_store(prefer_keyring: bool) -> Box<dyn SecretStore> {
    #[cfg(feature = "keyring-store")]
    if prefer_keyring {
        match KeyringStore::try_new("keyward") {
            Ok(store) => {
                tracing::info!("Using OS keyring for secret storage");
                return Box::new(store);
            }
            Err(e) => {
                tracing::warn!(
                    "Keyring unavailable ({}), falling back to memory store. \
                     Secrets will not persist across restarts.",
                    e
                );
            }
        }
    }

    #[cfg(not(feature = "keyring-store"))]
    if prefer_keyring {
        tracing::warn!(
            "Keyring storage requested but keyring-store feature not enabled. \
             Using memory store. Secrets will not persist across restarts."
        );
    }

    tracing::debug!("Using in-memory secret storage");
    Box::new(MemorySecretStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Credential;

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new("super-secret");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_secret_display_redacted() {
        let secret = Secret::new("super-secret");
        let display = format!("{}", secret);
        assert!(!display.contains("super-secret"));
        assert!(display.contains("REDACTED"));
    }

    #[test]
    fn test_secret_into_inner() {
        let secret = Secret::new("value");
        assert_eq!(secret.into_inner(), "value");
    }

    #[test]
    fn test_selector_matches() {
        let token = Token::access("google", Credential::bearer("t"))
            .with_owner(OwnerId::new("alice"))
            .with_id("7");

        assert!(TokenSelector::new().matches(&token));
        assert!(TokenSelector::by_id("7").matches(&token));
        assert!(!TokenSelector::by_id("8").matches(&token));
        assert!(TokenSelector::new().kind(TokenKind::Access).service("google").matches(&token));
        assert!(!TokenSelector::new().kind(TokenKind::Request).matches(&token));
        assert!(!TokenSelector::new().owner(Some(OwnerId::new("bob"))).matches(&token));
        assert!(TokenSelector::new().owner(None).matches(&token));
    }

    #[tokio::test]
    async fn test_create_secret_store_memory_fallback() {
        let store = create_secret_store(false);

        let secret = Secret::new("test");
        store.set("test-key", &secret).await.unwrap();
        let retrieved = store.get("test-key").await.unwrap();
        assert!(retrieved.is_some());
    }
}
