//! In-memory storage implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{Secret, SecretStore, StoreError, TokenSelector, TokenStore};
use crate::model::TokenId;
use crate::token::Token;

/// In-memory secret store for testing and development.
///
/// This store is not persistent; data is lost when the process exits.
pub struct MemorySecretStore {
    data: RwLock<HashMap<String, Secret>>,
}

impl MemorySecretStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Create a memory store with initial data.
    pub fn with_data(data: HashMap<String, Secret>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretStore")
            .field("keys_count", &self.data.read().len())
            .finish()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        self.data.write().insert(key.to_string(), secret.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct Rows {
    next_id: u64,
    tokens: BTreeMap<u64, Token>,
}

/// In-memory token store.
///
/// Ids are sequential integers starting at 1 and never reused.
#[derive(Default)]
pub struct MemoryTokenStore {
    rows: RwLock<Rows>,
}

impl MemoryTokenStore {
    /// Create an empty token store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTokenStore")
            .field("tokens_count", &self.rows.read().tokens.len())
            .finish()
    }
}

fn parse_row_id(id: &TokenId) -> Option<u64> {
    id.as_str().parse().ok()
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert(&self, token: &Token) -> Result<TokenId, StoreError> {
        let mut rows = self.rows.write();

        if token.is_access() {
            let existing = rows
                .tokens
                .iter()
                .find(|(_, stored)| stored.same_connection(token))
                .map(|(id, _)| *id);
            if let Some(id) = existing {
                let mut replacement = token.clone();
                replacement.unique_id = Some(TokenId::from(id));
                rows.tokens.insert(id, replacement);
                tracing::debug!("Updated existing {} connection {}", token.service, id);
                return Ok(TokenId::from(id));
            }
        }

        rows.next_id += 1;
        let id = rows.next_id;
        let mut stored = token.clone();
        stored.unique_id = Some(TokenId::from(id));
        rows.tokens.insert(id, stored);
        tracing::debug!("Inserted {} {} token {}", token.service, token.kind, id);
        Ok(TokenId::from(id))
    }

    async fn update(&self, token: &Token) -> Result<TokenId, StoreError> {
        let id = token.unique_id.as_ref().ok_or_else(|| StoreError::MissingId {
            service: token.service.to_string(),
        })?;
        let row = parse_row_id(id).ok_or_else(|| StoreError::NotFound {
            key: id.to_string(),
        })?;

        let mut rows = self.rows.write();
        match rows.tokens.get_mut(&row) {
            Some(stored) => {
                *stored = token.clone();
                Ok(id.clone())
            }
            None => Err(StoreError::NotFound {
                key: id.to_string(),
            }),
        }
    }

    async fn delete(&self, selector: &TokenSelector) -> Result<bool, StoreError> {
        if selector.is_empty() {
            return Err(StoreError::UnscopedDelete);
        }

        let mut rows = self.rows.write();
        let before = rows.tokens.len();
        rows.tokens.retain(|_, token| !selector.matches(token));
        Ok(rows.tokens.len() != before)
    }

    async fn get_tokens(&self, selector: &TokenSelector) -> Result<Vec<Token>, StoreError> {
        Ok(self
            .rows
            .read()
            .tokens
            .values()
            .filter(|token| selector.matches(token))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OwnerId, TokenKind};
    use crate::token::Credential;

    #[tokio::test]
    async fn test_memory_store_set_get() {
        let store = MemorySecretStore::new();
        store.set("test-key", &Secret::new("test-value")).await.unwrap();

        let retrieved = store.get("test-key").await.unwrap();
        assert_eq!(retrieved.unwrap().expose(), "test-value");
        assert!(store.get("nonexistent").await.unwrap().is_none());
    }

    #[test]
    fn test_memory_store_is_not_persistent() {
        let store: std::sync::Arc<dyn SecretStore> = std::sync::Arc::new(MemorySecretStore::new());
        assert!(!store.is_persistent());
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemorySecretStore::new();
        store.set("test-key", &Secret::new("test-value")).await.unwrap();
        store.delete("test-key").await.unwrap();
        assert!(!store.exists("test-key").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_list_keys() {
        let store = MemorySecretStore::new();
        store.set("keyward/app/twitter/key", &Secret::new("k")).await.unwrap();
        store.set("keyward/app/twitter/secret", &Secret::new("s")).await.unwrap();
        store.set("keyward/tokens/1/key", &Secret::new("t")).await.unwrap();

        assert_eq!(store.list_keys("keyward/app/twitter").await.unwrap().len(), 2);
        assert_eq!(store.list_keys("keyward").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let store = MemoryTokenStore::new();
        let first = store.insert(&Token::request("google")).await.unwrap();
        let second = store.insert(&Token::request("google")).await.unwrap();

        assert_eq!(first.as_str(), "1");
        assert_eq!(second.as_str(), "2");

        let fetched = store.get_token(&TokenSelector::by_id("2")).await.unwrap().unwrap();
        assert_eq!(fetched.unique_id, Some(second));
    }

    #[tokio::test]
    async fn test_access_insert_deduplicates() {
        let store = MemoryTokenStore::new();
        let token = Token::access("google", Credential::bearer("t"))
            .with_owner(OwnerId::new("1"));

        let first = store.insert(&token).await.unwrap();
        let again = store
            .insert(&token.clone().with_meta("name", "Alice"))
            .await
            .unwrap();

        assert_eq!(first, again);
        let all = store.get_tokens(&TokenSelector::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get_meta("name"), Some("Alice"));
    }

    #[tokio::test]
    async fn test_update_requires_id() {
        let store = MemoryTokenStore::new();
        let result = store.update(&Token::request("google")).await;
        assert!(matches!(result, Err(StoreError::MissingId { .. })));

        let result = store.update(&Token::request("google").with_id("99")).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_scoped_by_selector() {
        let store = MemoryTokenStore::new();
        store.insert(&Token::request("google")).await.unwrap();
        store
            .insert(&Token::access("google", Credential::bearer("a")))
            .await
            .unwrap();
        store
            .insert(&Token::access("twitter", Credential::pair("k", "s")))
            .await
            .unwrap();

        assert!(matches!(
            store.delete(&TokenSelector::new()).await,
            Err(StoreError::UnscopedDelete)
        ));

        let deleted = store
            .delete(&TokenSelector::new().kind(TokenKind::Access).service("google"))
            .await
            .unwrap();
        assert!(deleted);
        assert_eq!(store.count(&TokenSelector::new()).await.unwrap(), 2);

        let deleted = store.delete(&TokenSelector::by_id("42")).await.unwrap();
        assert!(!deleted);
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_delete() {
        let store = MemoryTokenStore::new();
        let first = store.insert(&Token::request("google")).await.unwrap();
        store.delete(&TokenSelector::by_id(first)).await.unwrap();
        let second = store.insert(&Token::request("google")).await.unwrap();
        assert_eq!(second.as_str(), "2");
    }
}
