//! AES-256-GCM sealing for cached credentials

use std::fmt;

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::zeroize::Zeroize;
use tracing::instrument;

use crate::error::{AuthError, AuthResult};

/// Length of an AES-256 key in bytes
pub const KEY_LEN: usize = 32;

/// Ciphertext with its nonce; the tag is appended to `ciphertext`
#[derive(Clone)]
pub(crate) struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealed")
            .field("nonce", &"[REDACTED]")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Process-local AEAD key with a CSPRNG for nonces
pub(crate) struct CacheCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl fmt::Debug for CacheCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCipher")
            .field("algorithm", &"AES-256-GCM")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl CacheCipher {
    /// Generate a fresh random key
    #[instrument(skip_all)]
    pub fn generate() -> AuthResult<Self> {
        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; KEY_LEN];
        rng.fill(&mut key_bytes)
            .map_err(|_| AuthError::Crypto("key generation failed".to_string()))?;
        let cipher = Self::from_key_with_rng(&key_bytes, rng);
        key_bytes.zeroize();
        cipher
    }

    /// Use caller-provided key material
    #[instrument(skip_all)]
    pub fn from_key(key: &[u8]) -> AuthResult<Self> {
        Self::from_key_with_rng(key, SystemRandom::new())
    }

    fn from_key_with_rng(key: &[u8], rng: SystemRandom) -> AuthResult<Self> {
        if key.len() != KEY_LEN {
            return Err(AuthError::Crypto(format!(
                "invalid cache key length: {} (expected {KEY_LEN})",
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| AuthError::Crypto("cipher key creation failed".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng,
        })
    }

    /// Encrypt `plaintext` bound to `aad`
    #[instrument(skip_all)]
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> AuthResult<Sealed> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| AuthError::Crypto("nonce generation failed".to_string()))?;

        let mut in_out = plaintext.to_vec();
        let sealed = self.key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad),
            &mut in_out,
        );
        if sealed.is_err() {
            in_out.zeroize();
            return Err(AuthError::Crypto("encryption failed".to_string()));
        }

        Ok(Sealed {
            nonce: nonce_bytes,
            ciphertext: in_out,
        })
    }

    /// Decrypt and authenticate against `aad`
    ///
    /// Any mismatch in key, nonce, ciphertext or associated data yields
    /// [`AuthError::CacheIntegrityMismatch`].
    #[instrument(skip_all)]
    pub fn open(&self, sealed: &Sealed, aad: &[u8]) -> AuthResult<Vec<u8>> {
        let mut in_out = sealed.ciphertext.clone();
        match self.key.open_in_place(
            Nonce::assume_unique_for_key(sealed.nonce),
            Aad::from(aad),
            &mut in_out,
        ) {
            Ok(plaintext) => {
                let len = plaintext.len();
                in_out.truncate(len);
                Ok(in_out)
            }
            Err(_) => {
                in_out.zeroize();
                Err(AuthError::CacheIntegrityMismatch)
            }
        }
    }
}
