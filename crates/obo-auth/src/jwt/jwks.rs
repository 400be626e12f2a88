//! JWKS (JSON Web Key Set) fetching and caching
//!
//! - **TTL-based caching**: keys are trusted for `jwks_cache_ttl_secs`
//! - **Refresh on unknown kid**: handles key rotation at the issuer
//! - **Rate limiting**: forced refreshes are spaced by `jwks_min_refresh_interval_secs`
//! - **Single flight**: concurrent misses share one outbound fetch
//!
//! A fetch that fails after retries surfaces as
//! [`AuthError::KeyFetchFailed`]; a stale key set is never served.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::VerifierConfig;
use crate::error::{AuthError, AuthResult};
use crate::retry::{RetryConfig, describe_transport_error};

/// JWKS cache entry with metadata
#[derive(Debug, Clone)]
struct CachedJwks {
    jwks: Arc<JwkSet>,
    fetched_at: Instant,
    /// Incremented on every successful fetch
    generation: u64,
}

impl CachedJwks {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Key set client for one issuer
#[derive(Debug)]
pub struct JwksClient {
    jwks_uri: String,
    http_client: reqwest::Client,
    cache: RwLock<Option<CachedJwks>>,
    /// Held for the duration of an outbound fetch
    fetch_lock: Mutex<()>,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
    retry: RetryConfig,
}

impl JwksClient {
    /// Create a client for `jwks_uri` sharing an existing HTTP client
    pub fn new(jwks_uri: String, http_client: reqwest::Client, config: &VerifierConfig) -> Self {
        Self {
            jwks_uri,
            http_client,
            cache: RwLock::new(None),
            fetch_lock: Mutex::new(()),
            cache_ttl: config.jwks_cache_ttl(),
            min_refresh_interval: config.jwks_min_refresh_interval(),
            retry: config.jwks_retry.clone(),
        }
    }

    /// Get the JWKS endpoint URI
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Resolve the verification key for `kid`
    ///
    /// Serves from cache while fresh. An unknown `kid` triggers one refresh,
    /// subject to the minimum refresh interval.
    ///
    /// # Errors
    ///
    /// [`AuthError::KeyFetchFailed`] when the key set cannot be fetched,
    /// [`AuthError::SignatureInvalid`] when no usable key carries `kid`.
    pub async fn decoding_key(&self, kid: &str) -> AuthResult<DecodingKey> {
        let (jwks, generation) = self.current().await?;
        if jwks.find(kid).is_some() {
            return to_decoding_key(&jwks, kid);
        }

        debug!(jwks_uri = %self.jwks_uri, kid, "Key ID not cached, refreshing JWKS");
        let jwks = self.refresh_after(generation).await?;
        to_decoding_key(&jwks, kid)
    }

    /// Fresh key set plus its generation, fetching when missing or expired
    async fn current(&self) -> AuthResult<(Arc<JwkSet>, u64)> {
        if let Some(cached) = self.cache.read().await.as_ref()
            && cached.is_fresh(self.cache_ttl)
        {
            return Ok((Arc::clone(&cached.jwks), cached.generation));
        }

        let _guard = self.fetch_lock.lock().await;

        // Another task may have completed the fetch while we waited
        if let Some(cached) = self.cache.read().await.as_ref()
            && cached.is_fresh(self.cache_ttl)
        {
            return Ok((Arc::clone(&cached.jwks), cached.generation));
        }

        let cached = self.fetch_and_store().await?;
        Ok((cached.jwks, cached.generation))
    }

    /// Refresh unless a newer generation than `seen` already exists or the
    /// last fetch is within the minimum refresh interval
    async fn refresh_after(&self, seen: u64) -> AuthResult<Arc<JwkSet>> {
        let _guard = self.fetch_lock.lock().await;

        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.generation != seen {
                return Ok(Arc::clone(&cached.jwks));
            }
            let since_last = cached.fetched_at.elapsed();
            if since_last < self.min_refresh_interval {
                warn!(
                    jwks_uri = %self.jwks_uri,
                    since_last_ms = since_last.as_millis() as u64,
                    "JWKS refresh rate limited, using cache"
                );
                return Ok(Arc::clone(&cached.jwks));
            }
        }

        Ok(self.fetch_and_store().await?.jwks)
    }

    /// Fetch with retries and replace the cache; caller holds `fetch_lock`
    async fn fetch_and_store(&self) -> AuthResult<CachedJwks> {
        let jwks = self
            .retry
            .run("jwks_fetch", |_| self.fetch_once())
            .await?;

        let mut cache = self.cache.write().await;
        let generation = cache.as_ref().map_or(1, |c| c.generation + 1);
        let entry = CachedJwks {
            jwks: Arc::new(jwks),
            fetched_at: Instant::now(),
            generation,
        };
        *cache = Some(entry.clone());
        Ok(entry)
    }

    async fn fetch_once(&self) -> AuthResult<JwkSet> {
        info!(jwks_uri = %self.jwks_uri, "Fetching JWKS from endpoint");

        let response = self
            .http_client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| {
                error!(jwks_uri = %self.jwks_uri, error = %e, "Failed to fetch JWKS");
                AuthError::KeyFetchFailed(describe_transport_error(&e))
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(
                jwks_uri = %self.jwks_uri,
                status = %status,
                "JWKS endpoint returned error status"
            );
            return Err(AuthError::KeyFetchFailed(format!(
                "JWKS endpoint returned status {}",
                status.as_u16()
            )));
        }

        let jwks: JwkSet = response.json().await.map_err(|e| {
            error!(jwks_uri = %self.jwks_uri, error = %e, "Failed to parse JWKS JSON");
            AuthError::KeyFetchFailed("invalid JWKS document".to_string())
        })?;

        info!(
            jwks_uri = %self.jwks_uri,
            key_count = jwks.keys.len(),
            "Successfully fetched JWKS"
        );
        Ok(jwks)
    }

    /// Drop the cached key set
    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
        debug!(jwks_uri = %self.jwks_uri, "JWKS cache cleared");
    }
}

fn to_decoding_key(jwks: &JwkSet, kid: &str) -> AuthResult<DecodingKey> {
    let jwk = jwks.find(kid).ok_or_else(|| {
        warn!(kid, "Key ID not found in JWKS");
        AuthError::SignatureInvalid(format!("no signing key with kid '{kid}'"))
    })?;

    DecodingKey::from_jwk(jwk).map_err(|e| {
        error!(kid, error = %e, "Failed to create decoding key from JWK");
        AuthError::SignatureInvalid(format!("signing key '{kid}' is unusable"))
    })
}
