//! Session registry
//!
//! A session binds a [`Principal`] to the bearer token that authenticated it.
//! The registry keeps at most one live session per `(issuer, subject)`; a
//! later authentication for the same identity refreshes that session.
//!
//! # Locking
//!
//! Locks are taken in the order index -> sessions -> cache, and a session's
//! `DashMap` entry is held while its cache entries are invalidated or
//! written. That serializes a fingerprint change against a concurrent cache
//! write for the same session.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::EncryptedTokenCache;
use crate::config::SessionConfig;
use crate::error::{AuthError, AuthResult};
use crate::types::{DerivedCredential, Principal};

/// Opaque session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new time-ordered identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// SHA-256 of a bearer token
///
/// Compared in constant time. `Debug` never prints the digest.
#[derive(Clone, Copy)]
pub struct TokenFingerprint([u8; 32]);

impl TokenFingerprint {
    /// Fingerprint a raw bearer token
    pub fn of(token: &str) -> Self {
        Self(Sha256::digest(token.as_bytes()).into())
    }

    /// Digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for TokenFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for TokenFingerprint {}

impl fmt::Debug for TokenFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenFingerprint([REDACTED])")
    }
}

/// Verified bearer token retained for on-behalf-of exchange
#[derive(Clone)]
pub struct BearerCredential {
    token: SecretString,
    fingerprint: TokenFingerprint,
    expires_at: SystemTime,
}

impl BearerCredential {
    /// Wrap a verified bearer token and its `exp`
    pub fn new(token: &str, expires_at: SystemTime) -> Self {
        Self {
            token: SecretString::new(token.to_string()),
            fingerprint: TokenFingerprint::of(token),
            expires_at,
        }
    }

    /// The token itself
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Fingerprint of the token
    pub fn fingerprint(&self) -> TokenFingerprint {
        self.fingerprint
    }

    /// Token `exp`
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }
}

impl fmt::Debug for BearerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerCredential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Snapshot of a live session
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    principal: Principal,
    fingerprint: TokenFingerprint,
    created_at: SystemTime,
    last_seen: SystemTime,
    expires_at: SystemTime,
}

impl Session {
    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Authenticated principal
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Fingerprint of the latest bearer token
    pub fn fingerprint(&self) -> TokenFingerprint {
        self.fingerprint
    }

    /// Creation time
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Last activity
    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    /// Eviction time: idle timeout or hard lifetime, whichever comes first
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }
}

#[derive(Debug)]
struct SessionRecord {
    session: Session,
    bearer: BearerCredential,
}

impl SessionRecord {
    fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.session.expires_at
    }
}

/// Live sessions keyed by id, with an `(issuer, subject)` index
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionRecord>,
    index: DashMap<(String, String), SessionId>,
    cache: Arc<EncryptedTokenCache>,
    idle_timeout: Duration,
    hard_ttl: Duration,
}

impl SessionRegistry {
    /// Create an empty registry whose evictions invalidate `cache`
    pub fn new(config: &SessionConfig, cache: Arc<EncryptedTokenCache>) -> Self {
        Self {
            sessions: DashMap::new(),
            index: DashMap::new(),
            cache,
            idle_timeout: config.idle_timeout(),
            hard_ttl: config.hard_ttl(),
        }
    }

    fn expiry(&self, created_at: SystemTime, last_seen: SystemTime) -> SystemTime {
        (last_seen + self.idle_timeout).min(created_at + self.hard_ttl)
    }

    /// Create a session, or refresh the live session for the same identity
    ///
    /// A refresh with a different bearer token invalidates every cached
    /// credential of the session before the new fingerprint is stored.
    pub fn upsert(&self, principal: Principal, bearer: BearerCredential, now: SystemTime) -> Session {
        let key = (principal.issuer().to_string(), principal.subject().to_string());
        let mut index_slot = self.index.entry(key).or_insert_with(SessionId::new);

        match self.sessions.entry(*index_slot) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let id = *occupied.key();
                let record = occupied.get_mut();

                if record.session.fingerprint != bearer.fingerprint {
                    let dropped = self.cache.invalidate_session(&id);
                    debug!(session_id = %id, dropped, "Bearer token changed, cache invalidated");
                }

                record.session.principal = principal;
                record.session.fingerprint = bearer.fingerprint;
                record.session.last_seen = now;
                record.session.expires_at = self.expiry(record.session.created_at, now);
                record.bearer = bearer;
                record.session.clone()
            }
            Entry::Occupied(expired) => {
                let (old_id, _) = expired.remove_entry();
                self.cache.invalidate_session(&old_id);
                debug!(session_id = %old_id, "Replacing expired session");

                let record = self.new_record(principal, bearer, now);
                let session = record.session.clone();
                *index_slot = session.id;
                self.sessions.insert(session.id, record);
                session
            }
            Entry::Vacant(vacant) => {
                let record = self.new_record_with_id(*vacant.key(), principal, bearer, now);
                let session = record.session.clone();
                vacant.insert(record);
                info!(session_id = %session.id, "Session created");
                session
            }
        }
    }

    fn new_record(&self, principal: Principal, bearer: BearerCredential, now: SystemTime) -> SessionRecord {
        self.new_record_with_id(SessionId::new(), principal, bearer, now)
    }

    fn new_record_with_id(
        &self,
        id: SessionId,
        principal: Principal,
        bearer: BearerCredential,
        now: SystemTime,
    ) -> SessionRecord {
        SessionRecord {
            session: Session {
                id,
                principal,
                fingerprint: bearer.fingerprint,
                created_at: now,
                last_seen: now,
                expires_at: self.expiry(now, now),
            },
            bearer,
        }
    }

    /// Look up a live session
    ///
    /// # Errors
    ///
    /// [`AuthError::SessionNotFound`] when the session does not exist or has
    /// expired.
    pub fn get(&self, id: &SessionId, now: SystemTime) -> AuthResult<Session> {
        match self.sessions.get(id) {
            None => return Err(AuthError::SessionNotFound),
            Some(record) if !record.is_expired(now) => return Ok(record.session.clone()),
            Some(_) => {}
        }
        self.evict_if_expired(id, now);
        Err(AuthError::SessionNotFound)
    }

    /// Record activity, extending the idle deadline up to the hard lifetime
    ///
    /// # Errors
    ///
    /// [`AuthError::SessionNotFound`] when the session does not exist or has
    /// expired.
    pub fn touch(&self, id: &SessionId, now: SystemTime) -> AuthResult<Session> {
        self.touch_with_bearer(id, now).map(|(session, _)| session)
    }

    /// Touch and return the retained bearer token
    pub(crate) fn touch_with_bearer(
        &self,
        id: &SessionId,
        now: SystemTime,
    ) -> AuthResult<(Session, BearerCredential)> {
        match self.sessions.get_mut(id) {
            None => return Err(AuthError::SessionNotFound),
            Some(mut record) if !record.is_expired(now) => {
                let created_at = record.session.created_at;
                record.session.last_seen = now;
                record.session.expires_at = self.expiry(created_at, now);
                return Ok((record.session.clone(), record.bearer.clone()));
            }
            Some(_) => {}
        }
        self.evict_if_expired(id, now);
        Err(AuthError::SessionNotFound)
    }

    /// Store an exchanged credential if the session still carries `fingerprint`
    ///
    /// Returns `Ok(false)` without caching when the session is gone or its
    /// bearer token changed since the exchange started.
    pub(crate) fn commit_credential(
        &self,
        id: &SessionId,
        fingerprint: &TokenFingerprint,
        credential: &DerivedCredential,
        now: SystemTime,
    ) -> AuthResult<bool> {
        let Some(record) = self.sessions.get_mut(id) else {
            return Ok(false);
        };
        if record.is_expired(now) || record.session.fingerprint != *fingerprint {
            return Ok(false);
        }
        self.cache.put(id, fingerprint, credential, now)?;
        drop(record);
        Ok(true)
    }

    /// Remove a session and every cached credential it owns
    ///
    /// # Errors
    ///
    /// [`AuthError::SessionNotFound`] when no such session exists.
    pub fn remove(&self, id: &SessionId) -> AuthResult<Session> {
        let (_, record) = self.sessions.remove(id).ok_or(AuthError::SessionNotFound)?;
        self.forget(&record.session);
        Ok(record.session)
    }

    fn evict_if_expired(&self, id: &SessionId, now: SystemTime) -> bool {
        match self.sessions.remove_if(id, |_, record| record.is_expired(now)) {
            Some((_, record)) => {
                self.forget(&record.session);
                debug!(session_id = %id, "Expired session evicted");
                true
            }
            None => false,
        }
    }

    /// Drop the index slot and cache entries of an already removed session
    fn forget(&self, session: &Session) {
        let key = (
            session.principal.issuer().to_string(),
            session.principal.subject().to_string(),
        );
        self.index.remove_if(&key, |_, indexed| *indexed == session.id);
        self.cache.invalidate_session(&session.id);
    }

    /// Evict every expired session; returns the number evicted
    pub fn sweep(&self, now: SystemTime) -> usize {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        let evicted = expired
            .iter()
            .filter(|id| self.evict_if_expired(id, now))
            .count();
        if evicted > 0 {
            info!(evicted, "Session sweep completed");
        }
        evicted
    }

    /// Number of tracked sessions, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
