//! Correlation nonces.
//!
//! Every inbound action carries two nonces: a coarse one scoped to the
//! action (`keyring-{action}`) and a fine one scoped to the service step
//! (`keyring-request-{service}` / `keyring-verify-{service}`). Both are
//! produced and checked by a [`NonceGuard`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::time::Duration;

use crate::error::KeywardError;
use crate::model::OwnerId;
use crate::store::Secret;

type HmacSha256 = Hmac<Sha256>;

/// Bytes of the MAC kept in a nonce.
const NONCE_BYTES: usize = 15;

/// Default validity of a nonce.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Creates and checks action-scoped nonces.
pub trait NonceGuard: Send + Sync {
    /// Create a nonce for an action on behalf of an owner.
    fn create(&self, action: &str, owner: Option<&OwnerId>) -> String;

    /// Check a nonce previously created for the same action and owner.
    fn verify(&self, nonce: &str, action: &str, owner: Option<&OwnerId>) -> bool;
}

/// Stateless nonces: a truncated HMAC-SHA256 over a time tick, the action
/// and the owner.
///
/// A nonce stays valid for the tick it was created in and the following
/// one, so between half a lifetime and a full lifetime.
pub struct HmacNonces {
    mac: HmacSha256,
    lifetime: Duration,
}

impl HmacNonces {
    /// Create a nonce guard keyed with `key`.
    pub fn new(key: &[u8]) -> Result<Self, KeywardError> {
        if key.is_empty() {
            return Err(KeywardError::Config {
                message: "nonce key must not be empty".to_string(),
            });
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|e| KeywardError::Config {
            message: format!("invalid nonce key: {}", e),
        })?;
        Ok(Self {
            mac,
            lifetime: DEFAULT_LIFETIME,
        })
    }

    /// Set the nonce lifetime.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Generate a random key suitable for [`HmacNonces::new`].
    pub fn generate_key() -> Secret {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Secret::new(URL_SAFE_NO_PAD.encode(bytes))
    }

    fn tick(&self, now: i64) -> i64 {
        let half = (self.lifetime.as_secs() / 2).max(1) as i64;
        // ceil(now / half)
        (now + half - 1) / half
    }

    fn keyed(&self, tick: i64, action: &str, owner: Option<&OwnerId>) -> HmacSha256 {
        let mut mac = self.mac.clone();
        let owner = owner.map(OwnerId::as_str).unwrap_or_default();
        mac.update(format!("{}|{}|{}", tick, action, owner).as_bytes());
        mac
    }

    fn create_at(&self, now: i64, action: &str, owner: Option<&OwnerId>) -> String {
        let tag = self.keyed(self.tick(now), action, owner).finalize().into_bytes();
        URL_SAFE_NO_PAD.encode(&tag[..NONCE_BYTES])
    }

    fn verify_at(&self, now: i64, nonce: &str, action: &str, owner: Option<&OwnerId>) -> bool {
        let Ok(tag) = URL_SAFE_NO_PAD.decode(nonce) else {
            return false;
        };
        if tag.len() != NONCE_BYTES {
            return false;
        }
        let tick = self.tick(now);
        [tick, tick - 1].into_iter().any(|t| {
            self.keyed(t, action, owner)
                .verify_truncated_left(&tag)
                .is_ok()
        })
    }
}

impl NonceGuard for HmacNonces {
    fn create(&self, action: &str, owner: Option<&OwnerId>) -> String {
        self.create_at(Utc::now().timestamp(), action, owner)
    }

    fn verify(&self, nonce: &str, action: &str, owner: Option<&OwnerId>) -> bool {
        let valid = self.verify_at(Utc::now().timestamp(), nonce, action, owner);
        if !valid {
            tracing::debug!("Rejected nonce for {}", action);
        }
        valid
    }
}

impl std::fmt::Debug for HmacNonces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacNonces")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> HmacNonces {
        HmacNonces::new(b"test-key").unwrap()
    }

    #[test]
    fn test_round_trip() {
        let nonces = guard();
        let owner = OwnerId::new("1");
        let nonce = nonces.create("keyring-request", Some(&owner));
        assert_eq!(nonce.len(), 20);
        assert!(nonces.verify(&nonce, "keyring-request", Some(&owner)));
    }

    #[test]
    fn test_scoped_to_action_and_owner() {
        let nonces = guard();
        let owner = OwnerId::new("1");
        let nonce = nonces.create("keyring-request", Some(&owner));

        assert!(!nonces.verify(&nonce, "keyring-delete", Some(&owner)));
        assert!(!nonces.verify(&nonce, "keyring-request", Some(&OwnerId::new("2"))));
        assert!(!nonces.verify(&nonce, "keyring-request", None));
    }

    #[test]
    fn test_rejects_garbage() {
        let nonces = guard();
        assert!(!nonces.verify("", "keyring-request", None));
        assert!(!nonces.verify("not base64 !!", "keyring-request", None));
        assert!(!nonces.verify("AAAA", "keyring-request", None));
    }

    #[test]
    fn test_different_keys_disagree() {
        let nonce = guard().create("keyring-manage", None);
        let other = HmacNonces::new(b"other-key").unwrap();
        assert!(!other.verify(&nonce, "keyring-manage", None));
    }

    #[test]
    fn test_expiry_window() {
        let nonces = guard().with_lifetime(Duration::from_secs(100));
        let created = 1_000_000;
        let nonce = nonces.create_at(created, "keyring-verify", None);

        assert!(nonces.verify_at(created + 49, &nonce, "keyring-verify", None));
        assert!(!nonces.verify_at(created + 101, &nonce, "keyring-verify", None));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(HmacNonces::new(b""), Err(KeywardError::Config { .. })));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(
            HmacNonces::generate_key().expose(),
            HmacNonces::generate_key().expose()
        );
    }
}
