//! Encrypted cache for exchanged credentials
//!
//! Entries are keyed by `(session id, audience)` and sealed with AES-256-GCM.
//! The associated data covers the session id, the audience and the
//! fingerprint of the bearer token the credential was exchanged for. The
//! fingerprint itself is not stored: a lookup with any other fingerprint
//! fails authentication, is reported as a miss, and evicts the entry.
//!
//! Entry lifetime is `min(max_ttl, credential expiry - now)` and is never
//! extended.

mod cipher;

pub use cipher::KEY_LEN;

use std::collections::BTreeMap;
use std::time::SystemTime;

use dashmap::DashMap;
use secrecy::zeroize::Zeroize;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{AuthError, AuthResult};
use crate::auth_metrics;
use crate::session::{SessionId, TokenFingerprint};
use crate::types::DerivedCredential;
use cipher::{CacheCipher, Sealed};

const AAD_CONTEXT: &[u8] = b"obo-cache-v1";

/// Result of a cache lookup
#[derive(Debug)]
pub enum CacheLookup {
    /// Entry found and authenticated
    Hit(DerivedCredential),
    /// No entry for this session and audience
    Miss,
    /// Entry had reached its expiry and was evicted
    Expired,
    /// Entry failed authentication (bearer token changed) and was evicted
    Rejected,
}

impl CacheLookup {
    /// The credential on a hit
    pub fn into_credential(self) -> Option<DerivedCredential> {
        match self {
            CacheLookup::Hit(credential) => Some(credential),
            _ => None,
        }
    }

    /// Short label for audit details and logs
    pub fn label(&self) -> &'static str {
        match self {
            CacheLookup::Hit(_) => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Expired => "expired",
            CacheLookup::Rejected => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    session_id: SessionId,
    audience: String,
}

#[derive(Debug)]
struct CacheEntry {
    sealed: Sealed,
    token_expires_at: SystemTime,
    /// `min(now + max_ttl, token_expires_at)` at insertion
    expires_at: SystemTime,
}

/// Plaintext layout inside the ciphertext
#[derive(Serialize, Deserialize)]
struct SealedCredential {
    token: String,
    token_type: String,
    roles: Vec<String>,
    claims: BTreeMap<String, Value>,
}

/// AEAD-protected credential store
#[derive(Debug)]
pub struct EncryptedTokenCache {
    entries: DashMap<CacheKey, CacheEntry>,
    cipher: CacheCipher,
    config: CacheConfig,
}

impl EncryptedTokenCache {
    /// Create a cache with a freshly generated process-local key
    ///
    /// # Errors
    ///
    /// [`AuthError::Crypto`] when the system CSPRNG is unavailable.
    pub fn new(config: &CacheConfig) -> AuthResult<Self> {
        Ok(Self {
            entries: DashMap::new(),
            cipher: CacheCipher::generate()?,
            config: config.clone(),
        })
    }

    /// Create a cache with caller-provided key material
    ///
    /// # Errors
    ///
    /// [`AuthError::Crypto`] unless `key` is [`KEY_LEN`] bytes.
    pub fn with_key(config: &CacheConfig, key: &[u8]) -> AuthResult<Self> {
        Ok(Self {
            entries: DashMap::new(),
            cipher: CacheCipher::from_key(key)?,
            config: config.clone(),
        })
    }

    /// Look up the credential for `(session_id, audience)` under `fingerprint`
    pub fn get(
        &self,
        session_id: &SessionId,
        audience: &str,
        fingerprint: &TokenFingerprint,
        now: SystemTime,
    ) -> CacheLookup {
        let key = CacheKey {
            session_id: *session_id,
            audience: audience.to_string(),
        };

        let (sealed, token_expires_at, expired) = match self.entries.get(&key) {
            None => {
                auth_metrics::record_cache_lookup(false);
                return CacheLookup::Miss;
            }
            Some(entry) => (
                entry.sealed.clone(),
                entry.token_expires_at,
                now >= entry.expires_at,
            ),
        };

        if expired {
            self.entries
                .remove_if(&key, |_, entry| entry.sealed.nonce == sealed.nonce);
            debug!(session_id = %session_id, audience, "Cached credential expired");
            auth_metrics::record_cache_lookup(false);
            return CacheLookup::Expired;
        }

        let aad = associated_data(session_id, audience, fingerprint);
        let mut plaintext = match self.cipher.open(&sealed, &aad) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.entries
                    .remove_if(&key, |_, entry| entry.sealed.nonce == sealed.nonce);
                warn!(
                    session_id = %session_id,
                    audience,
                    "Cached credential failed authentication, evicted"
                );
                auth_metrics::record_cache_lookup(false);
                return CacheLookup::Rejected;
            }
        };

        let decoded = serde_json::from_slice::<SealedCredential>(&plaintext);
        plaintext.zeroize();

        match decoded {
            Ok(stored) => {
                auth_metrics::record_cache_lookup(true);
                CacheLookup::Hit(DerivedCredential {
                    token: SecretString::new(stored.token),
                    audience: audience.to_string(),
                    token_type: stored.token_type,
                    expires_at: token_expires_at,
                    roles: stored.roles,
                    claims: stored.claims,
                })
            }
            Err(_) => {
                self.entries.remove(&key);
                warn!(session_id = %session_id, audience, "Cached credential undecodable, evicted");
                auth_metrics::record_cache_lookup(false);
                CacheLookup::Rejected
            }
        }
    }

    /// Seal and store `credential` for `(session_id, credential.audience)`
    ///
    /// # Errors
    ///
    /// [`AuthError::CacheRejected`] when the credential has no remaining
    /// lifetime, [`AuthError::Crypto`] when sealing fails.
    pub fn put(
        &self,
        session_id: &SessionId,
        fingerprint: &TokenFingerprint,
        credential: &DerivedCredential,
        now: SystemTime,
    ) -> AuthResult<()> {
        let remaining = credential.remaining_lifetime(now).ok_or_else(|| {
            AuthError::CacheRejected("credential has no remaining lifetime".to_string())
        })?;
        let ttl = remaining.min(self.config.max_ttl());

        let mut plaintext = serde_json::to_vec(&SealedCredential {
            token: credential.token.expose_secret().clone(),
            token_type: credential.token_type.clone(),
            roles: credential.roles.clone(),
            claims: credential.claims.clone(),
        })
        .map_err(|e| AuthError::CacheRejected(format!("credential not serializable: {e}")))?;

        let aad = associated_data(session_id, &credential.audience, fingerprint);
        let sealed = self.cipher.seal(&plaintext, &aad);
        plaintext.zeroize();
        let sealed = sealed?;

        let key = CacheKey {
            session_id: *session_id,
            audience: credential.audience.clone(),
        };
        if !self.entries.contains_key(&key) {
            self.make_room(now);
        }

        self.entries.insert(
            key,
            CacheEntry {
                sealed,
                token_expires_at: credential.expires_at,
                expires_at: now + ttl,
            },
        );
        debug!(
            session_id = %session_id,
            audience = %credential.audience,
            ttl_secs = ttl.as_secs(),
            "Credential cached"
        );
        Ok(())
    }

    /// Evict expired entries, then the entry closest to expiry while full
    fn make_room(&self, now: SystemTime) {
        if self.entries.len() < self.config.max_entries {
            return;
        }
        self.sweep(now);
        while self.entries.len() >= self.config.max_entries {
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().expires_at)
                .map(|entry| entry.key().clone());
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                    debug!(session_id = %key.session_id, "Cache full, evicted entry closest to expiry");
                }
                None => break,
            }
        }
    }

    /// Remove every entry of a session; returns the number removed
    pub fn invalidate_session(&self, session_id: &SessionId) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let keep = key.session_id != *session_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Remove expired entries; returns the number removed
    pub fn sweep(&self, now: SystemTime) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = now < entry.expires_at;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expiry of the entry for `(session_id, audience)`, if present
    pub fn entry_expiry(&self, session_id: &SessionId, audience: &str) -> Option<SystemTime> {
        self.entries
            .get(&CacheKey {
                session_id: *session_id,
                audience: audience.to_string(),
            })
            .map(|entry| entry.expires_at)
    }
}

/// Context string followed by length-prefixed session id, audience and
/// fingerprint
fn associated_data(
    session_id: &SessionId,
    audience: &str,
    fingerprint: &TokenFingerprint,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_CONTEXT.len() + 16 + audience.len() + 32 + 12);
    aad.extend_from_slice(AAD_CONTEXT);
    for part in [
        session_id.as_bytes().as_slice(),
        audience.as_bytes(),
        fingerprint.as_bytes().as_slice(),
    ] {
        aad.extend_from_slice(&(part.len() as u32).to_be_bytes());
        aad.extend_from_slice(part);
    }
    aad
}
