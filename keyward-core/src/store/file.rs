//! Disk-backed token storage.
//!
//! Token rows (service, kind, owner, metadata) are kept in a versioned JSON
//! file. Credential material never touches that file: it is written to a
//! [`SecretStore`] under `keyward/tokens/{id}/key` and
//! `keyward/tokens/{id}/secret`.
//!
//! # Storage Location
//!
//! By default the file lives at `tokens.json` inside the platform data
//! directory (`~/.local/share/keyward` on Linux).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{Secret, SecretStore, StoreError, TokenSelector, TokenStore};
use crate::model::{OwnerId, ServiceId, TokenId, TokenKind};
use crate::token::{Credential, Token, TokenMeta};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CredentialShape {
    Bearer,
    Pair,
}

/// A token row as written to disk, without credential values.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    id: u64,
    service: ServiceId,
    kind: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<OwnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    credential: Option<CredentialShape>,
    #[serde(default)]
    meta: TokenMeta,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenFile {
    /// Version of the store format (for future migrations).
    version: u32,
    next_id: u64,
    rows: Vec<StoredRow>,
}

impl Default for TokenFile {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            next_id: 0,
            rows: Vec::new(),
        }
    }
}

/// Token store persisting rows to a JSON file and credentials to a
/// [`SecretStore`].
///
/// Writes go to a temporary file that is renamed over the original, so a
/// crash never leaves a half-written store behind.
pub struct FileTokenStore<S> {
    path: PathBuf,
    secrets: S,
    data: Mutex<TokenFile>,
}

impl<S: SecretStore> FileTokenStore<S> {
    /// Get the default path for the token file.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let dirs = directories::ProjectDirs::from("com", "raibid-labs", "keyward")
            .ok_or(StoreError::DataDirUnavailable)?;
        Ok(dirs.data_dir().join("tokens.json"))
    }

    /// Load the store from a specific path.
    ///
    /// Creates parent directories if they don't exist. A missing file is an
    /// empty store.
    pub async fn load_from_path(path: impl Into<PathBuf>, secrets: S) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let data: TokenFile = serde_json::from_str(&contents)?;
                if data.version > FORMAT_VERSION {
                    return Err(StoreError::BackendError {
                        message: format!(
                            "token file {} has unsupported version {}",
                            path.display(),
                            data.version
                        ),
                    });
                }
                data
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TokenFile::default(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("Loaded {} token rows from {}", data.rows.len(), path.display());

        Ok(Self {
            path,
            secrets,
            data: Mutex::new(data),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn secret_key(id: u64, part: &str) -> String {
        format!("keyward/tokens/{}/{}", id, part)
    }

    async fn save(&self, data: &TokenFile) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn write_credential(
        &self,
        id: u64,
        credential: Option<&Credential>,
    ) -> Result<Option<CredentialShape>, StoreError> {
        match credential {
            None => {
                self.clear_credential(id).await?;
                Ok(None)
            }
            Some(Credential::Bearer { token }) => {
                self.secrets.set(&Self::secret_key(id, "key"), token).await?;
                self.secrets.delete(&Self::secret_key(id, "secret")).await?;
                Ok(Some(CredentialShape::Bearer))
            }
            Some(Credential::Pair { key, secret }) => {
                self.secrets.set(&Self::secret_key(id, "key"), key).await?;
                self.secrets.set(&Self::secret_key(id, "secret"), secret).await?;
                Ok(Some(CredentialShape::Pair))
            }
        }
    }

    async fn clear_credential(&self, id: u64) -> Result<(), StoreError> {
        self.secrets.delete(&Self::secret_key(id, "key")).await?;
        self.secrets.delete(&Self::secret_key(id, "secret")).await
    }

    async fn read_secret(&self, id: u64, part: &str) -> Result<Option<Secret>, StoreError> {
        self.secrets.get(&Self::secret_key(id, part)).await
    }

    /// Rebuild the token for `row`. Returns `None` when the row's credential
    /// is gone from the secret store, e.g. after a restart on a
    /// non-persistent secret backend.
    async fn hydrate(&self, row: &StoredRow) -> Result<Option<Token>, StoreError> {
        let credential = match row.credential {
            None => None,
            Some(CredentialShape::Bearer) => match self.read_secret(row.id, "key").await? {
                Some(token) => Some(Credential::Bearer { token }),
                None => return Ok(None),
            },
            Some(CredentialShape::Pair) => {
                let key = self.read_secret(row.id, "key").await?;
                let secret = self.read_secret(row.id, "secret").await?;
                match (key, secret) {
                    (Some(key), Some(secret)) => Some(Credential::Pair { key, secret }),
                    _ => return Ok(None),
                }
            }
        };

        Ok(Some(Token {
            service: row.service.clone(),
            kind: row.kind,
            credential,
            meta: row.meta.clone(),
            owner: row.owner.clone(),
            unique_id: Some(TokenId::from(row.id)),
            created_at: row.created_at,
        }))
    }

    /// Hydrate every row accepted by `filter`, collecting the ids of
    /// orphaned rows instead of failing on them.
    async fn hydrate_rows(
        &self,
        data: &TokenFile,
        filter: impl Fn(&StoredRow) -> bool,
    ) -> Result<(Vec<Token>, Vec<u64>), StoreError> {
        let mut tokens = Vec::new();
        let mut orphans = Vec::new();
        for row in &data.rows {
            if !filter(row) {
                continue;
            }
            match self.hydrate(row).await? {
                Some(token) => tokens.push(token),
                None => {
                    tracing::warn!(
                        "Dropping {} token {}: its credential is missing from the secret store",
                        row.service,
                        row.id
                    );
                    orphans.push(row.id);
                }
            }
        }
        Ok((tokens, orphans))
    }

    /// Find an access row holding the same connection as `token`, along with
    /// any orphaned rows seen on the way.
    async fn find_duplicate(
        &self,
        data: &TokenFile,
        token: &Token,
    ) -> Result<(Option<u64>, Vec<u64>), StoreError> {
        let (candidates, orphans) = self
            .hydrate_rows(data, |row| {
                row.kind == TokenKind::Access
                    && row.service == token.service
                    && row.owner == token.owner
            })
            .await?;
        let duplicate = candidates
            .iter()
            .find(|candidate| candidate.same_connection(token))
            .and_then(|candidate| candidate.unique_id.as_ref())
            .and_then(|id| id.as_str().parse().ok());
        Ok((duplicate, orphans))
    }

    /// Clear leftover secrets of rows that were dropped from the file.
    async fn forget(&self, ids: &[u64]) {
        for id in ids {
            if let Err(e) = self.clear_credential(*id).await {
                tracing::warn!("Failed to clear secrets of token {}: {}", id, e);
            }
        }
    }

    fn row_matches(selector: &TokenSelector, row: &StoredRow) -> bool {
        if let Some(id) = &selector.id {
            if id.as_str() != row.id.to_string() {
                return false;
            }
        }
        if let Some(kind) = selector.kind {
            if row.kind != kind {
                return false;
            }
        }
        if let Some(service) = &selector.service {
            if &row.service != service {
                return false;
            }
        }
        if let Some(owner) = &selector.owner {
            if row.owner.as_ref() != Some(owner) {
                return false;
            }
        }
        true
    }
}

// Every mutation is applied to a copy of the file, saved, and only then
// swapped in, so a failed write leaves memory and disk unchanged.
#[async_trait]
impl<S: SecretStore> TokenStore for FileTokenStore<S> {
    async fn insert(&self, token: &Token) -> Result<TokenId, StoreError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();

        let mut orphans = Vec::new();
        if token.is_access() {
            let (duplicate, dropped) = self.find_duplicate(&data, token).await?;
            next.rows.retain(|row| !dropped.contains(&row.id));
            orphans = dropped;

            if let Some(id) = duplicate {
                let shape = self.write_credential(id, token.credential.as_ref()).await?;
                if let Some(row) = next.rows.iter_mut().find(|row| row.id == id) {
                    row.meta = token.meta.clone();
                    row.credential = shape;
                }
                self.save(&next).await?;
                *data = next;
                self.forget(&orphans).await;
                tracing::debug!("Updated existing {} connection {}", token.service, id);
                return Ok(TokenId::from(id));
            }
        }

        next.next_id += 1;
        let id = next.next_id;
        let shape = self.write_credential(id, token.credential.as_ref()).await?;
        next.rows.push(StoredRow {
            id,
            service: token.service.clone(),
            kind: token.kind,
            owner: token.owner.clone(),
            credential: shape,
            meta: token.meta.clone(),
            created_at: token.created_at,
        });
        if let Err(e) = self.save(&next).await {
            self.forget(&[id]).await;
            return Err(e);
        }
        *data = next;
        self.forget(&orphans).await;

        tracing::debug!("Inserted {} {} token {}", token.service, token.kind, id);
        Ok(TokenId::from(id))
    }

    async fn update(&self, token: &Token) -> Result<TokenId, StoreError> {
        let id = token.unique_id.clone().ok_or_else(|| StoreError::MissingId {
            service: token.service.to_string(),
        })?;
        let row_id: u64 = id.as_str().parse().map_err(|_| StoreError::NotFound {
            key: id.to_string(),
        })?;

        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let row = next
            .rows
            .iter_mut()
            .find(|row| row.id == row_id)
            .ok_or_else(|| StoreError::NotFound { key: id.to_string() })?;

        let previous = self
            .hydrate(row)
            .await?
            .and_then(|previous| previous.credential);
        let shape = self.write_credential(row_id, token.credential.as_ref()).await?;
        row.service = token.service.clone();
        row.kind = token.kind;
        row.owner = token.owner.clone();
        row.credential = shape;
        row.meta = token.meta.clone();

        if let Err(e) = self.save(&next).await {
            if let Err(restore) = self.write_credential(row_id, previous.as_ref()).await {
                tracing::warn!("Failed to restore secrets of token {}: {}", row_id, restore);
            }
            return Err(e);
        }
        *data = next;

        Ok(id)
    }

    async fn delete(&self, selector: &TokenSelector) -> Result<bool, StoreError> {
        if selector.is_empty() {
            return Err(StoreError::UnscopedDelete);
        }

        let mut data = self.data.lock().await;
        let doomed: Vec<u64> = data
            .rows
            .iter()
            .filter(|row| Self::row_matches(selector, row))
            .map(|row| row.id)
            .collect();
        if doomed.is_empty() {
            return Ok(false);
        }

        let mut next = data.clone();
        next.rows.retain(|row| !doomed.contains(&row.id));
        self.save(&next).await?;
        *data = next;
        for id in doomed {
            self.clear_credential(id).await?;
        }
        Ok(true)
    }

    async fn get_tokens(&self, selector: &TokenSelector) -> Result<Vec<Token>, StoreError> {
        let mut data = self.data.lock().await;
        let (tokens, orphans) = self
            .hydrate_rows(&data, |row| Self::row_matches(selector, row))
            .await?;

        if !orphans.is_empty() {
            let mut next = data.clone();
            next.rows.retain(|row| !orphans.contains(&row.id));
            match self.save(&next).await {
                Ok(()) => {
                    *data = next;
                    self.forget(&orphans).await;
                }
                Err(e) => tracing::warn!("Failed to drop orphaned token rows: {}", e),
            }
        }

        Ok(tokens)
    }
}

impl<S> std::fmt::Debug for FileTokenStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTokenStore")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySecretStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tokens.json");
        let secrets = Arc::new(MemorySecretStore::new());

        let store = FileTokenStore::load_from_path(&path, secrets.clone()).await.unwrap();
        let id = store
            .insert(
                &Token::access("twitter", Credential::pair("at1", "as1"))
                    .with_owner(OwnerId::new("1"))
                    .with_meta("screen_name", "keyward"),
            )
            .await
            .unwrap();
        drop(store);

        let reloaded = FileTokenStore::load_from_path(&path, secrets).await.unwrap();
        let token = reloaded
            .get_token(&TokenSelector::by_id(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.credential, Some(Credential::pair("at1", "as1")));
        assert_eq!(token.get_meta("screen_name"), Some("keyward"));
    }

    #[tokio::test]
    async fn test_credentials_not_written_to_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tokens.json");
        let store = FileTokenStore::load_from_path(&path, MemorySecretStore::new())
            .await
            .unwrap();

        store
            .insert(&Token::access("google", Credential::bearer("super-secret-token")))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("super-secret-token"));
        assert!(contents.contains("\"bearer\""));
    }

    #[tokio::test]
    async fn test_delete_clears_secrets() {
        let temp = TempDir::new().unwrap();
        let secrets = Arc::new(MemorySecretStore::new());
        let store = FileTokenStore::load_from_path(temp.path().join("tokens.json"), secrets.clone())
            .await
            .unwrap();

        let id = store
            .insert(&Token::access("twitter", Credential::pair("k", "s")))
            .await
            .unwrap();
        assert_eq!(secrets.list_keys("keyward/tokens/").await.unwrap().len(), 2);

        assert!(store.delete(&TokenSelector::by_id(id)).await.unwrap());
        assert!(secrets.list_keys("keyward/tokens/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_dedupe() {
        let temp = TempDir::new().unwrap();
        let store = FileTokenStore::load_from_path(
            temp.path().join("tokens.json"),
            MemorySecretStore::new(),
        )
        .await
        .unwrap();

        let request = store.insert(&Token::request("google")).await.unwrap();
        let mut token = store
            .get_token(&TokenSelector::by_id(request.clone()))
            .await
            .unwrap()
            .unwrap();
        token.meta.insert("_redirect_uri", "https://app.example.com/cb");
        store.update(&token).await.unwrap();

        let token = store
            .get_token(&TokenSelector::by_id(request))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.get_meta("_redirect_uri"), Some("https://app.example.com/cb"));

        let access = Token::access("google", Credential::bearer("a"));
        let first = store.insert(&access).await.unwrap();
        let second = store.insert(&access).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count(&TokenSelector::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejects_newer_format() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tokens.json");
        std::fs::write(&path, r#"{"version": 99, "next_id": 0, "rows": []}"#).unwrap();

        let result = FileTokenStore::load_from_path(&path, MemorySecretStore::new()).await;
        assert!(matches!(result, Err(StoreError::BackendError { .. })));
    }

    #[tokio::test]
    async fn test_rows_without_secrets_are_dropped_after_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tokens.json");

        let store = FileTokenStore::load_from_path(&path, MemorySecretStore::new())
            .await
            .unwrap();
        let owner = Some(OwnerId::new("1"));
        store
            .insert(&Token::access("twitter", Credential::pair("at1", "as1")).with_owner(OwnerId::new("1")))
            .await
            .unwrap();
        let request = store.insert(&Token::request("twitter")).await.unwrap();
        drop(store);

        // Fresh secret backend: the access row's credential is gone.
        let secrets = Arc::new(MemorySecretStore::new());
        let store = FileTokenStore::load_from_path(&path, secrets.clone()).await.unwrap();
        let access = TokenSelector::new()
            .kind(TokenKind::Access)
            .service("twitter")
            .owner(owner.clone());
        assert!(store.get_tokens(&access).await.unwrap().is_empty());
        assert!(
            store
                .get_token(&TokenSelector::by_id(request.clone()))
                .await
                .unwrap()
                .is_some()
        );

        let id = store
            .insert(&Token::access("twitter", Credential::pair("at2", "as2")).with_owner(OwnerId::new("1")))
            .await
            .unwrap();
        assert_eq!(id.as_str(), "3");
        drop(store);

        let store = FileTokenStore::load_from_path(&path, secrets).await.unwrap();
        let tokens = store.get_tokens(&access).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].credential, Some(Credential::pair("at2", "as2")));
        assert_eq!(store.count(&TokenSelector::new()).await.unwrap(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("\"id\": 1,"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_store_unchanged() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tokens.json");
        let secrets = Arc::new(MemorySecretStore::new());
        let store = FileTokenStore::load_from_path(&path, secrets.clone()).await.unwrap();

        let id = store
            .insert(&Token::access("google", Credential::bearer("a")).with_meta("email", "a@example.com"))
            .await
            .unwrap();

        // A directory in place of the temp file makes every save fail.
        let blocker = temp.path().join("tokens.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let result = store.insert(&Token::access("google", Credential::bearer("b"))).await;
        assert!(matches!(result, Err(StoreError::Io(_))));
        assert_eq!(store.count(&TokenSelector::new()).await.unwrap(), 1);
        assert_eq!(secrets.list_keys("keyward/tokens/").await.unwrap().len(), 1);

        let mut changed = store
            .get_token(&TokenSelector::by_id(id.clone()))
            .await
            .unwrap()
            .unwrap();
        changed.credential = Some(Credential::bearer("rotated"));
        changed.meta.insert("email", "b@example.com");
        assert!(store.update(&changed).await.is_err());

        assert!(store.delete(&TokenSelector::by_id(id.clone())).await.is_err());

        let token = store
            .get_token(&TokenSelector::by_id(id.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.credential, Some(Credential::bearer("a")));
        assert_eq!(token.get_meta("email"), Some("a@example.com"));

        std::fs::remove_dir(&blocker).unwrap();
        let next = store
            .insert(&Token::access("google", Credential::bearer("b")))
            .await
            .unwrap();
        assert_eq!(next.as_str(), "2");

        let reloaded = FileTokenStore::load_from_path(&path, secrets).await.unwrap();
        assert_eq!(reloaded.count(&TokenSelector::new()).await.unwrap(), 2);
    }
}
