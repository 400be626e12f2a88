//! Authentication orchestrator
//!
//! The single entry point composing verification, claim mapping, sessions,
//! the encrypted credential cache and token exchange.
//!
//! State is committed only after every awaited step has finished, so a
//! cancelled `authenticate` or `exchange` leaves sessions and cache untouched.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventKind, AuditSink, NoopAuditSink};
use crate::cache::{CacheLookup, EncryptedTokenCache};
use crate::claims::map_principal;
use crate::clock::{Clock, SystemClock, to_unix};
use crate::config::{CoreConfig, TrustedIssuer};
use crate::error::{AuthError, AuthResult};
use crate::exchange::TokenExchangeClient;
use crate::jwt::TokenVerifier;
use crate::auth_metrics;
use crate::session::{BearerCredential, Session, SessionId, SessionRegistry};
use crate::types::{DerivedCredential, Principal};

const SOURCE_AUTHENTICATE: &str = "authenticate";
const SOURCE_EXCHANGE: &str = "exchange";
const SOURCE_LOGOUT: &str = "logout";

/// Shortest interval accepted by [`AuthenticationOrchestrator::spawn_maintenance`]
pub const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(10);

/// Authentication and on-behalf-of delegation entry point
///
/// Safe to share across tasks behind an [`Arc`].
#[derive(Debug)]
pub struct AuthenticationOrchestrator {
    verifier: TokenVerifier,
    sessions: SessionRegistry,
    cache: Arc<EncryptedTokenCache>,
    exchange_client: TokenExchangeClient,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl AuthenticationOrchestrator {
    /// Build every component from a validated configuration
    ///
    /// Audit events are dropped and the system clock is used until
    /// [`with_audit_sink`](Self::with_audit_sink) and
    /// [`with_clock`](Self::with_clock) say otherwise.
    ///
    /// # Errors
    ///
    /// [`AuthError::Configuration`] when the configuration is invalid,
    /// [`AuthError::Crypto`] when the cache key cannot be generated.
    pub fn new(config: CoreConfig) -> AuthResult<Self> {
        config.validate()?;

        let verifier = TokenVerifier::new(&config.issuers, &config.verifier)?;
        let cache = Arc::new(EncryptedTokenCache::new(&config.cache)?);
        let sessions = SessionRegistry::new(&config.session, Arc::clone(&cache));
        let exchange_client =
            TokenExchangeClient::new(config.verifier.http_timeout(), config.exchange_retry.clone())?;

        info!(
            issuers = config.issuers.len(),
            cache_max_entries = config.cache.max_entries,
            "Authentication orchestrator initialized"
        );

        Ok(Self {
            verifier,
            sessions,
            cache,
            exchange_client,
            audit: Arc::new(NoopAuditSink),
            clock: Arc::new(SystemClock),
        })
    }

    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Verify a bearer token and establish or refresh its session
    ///
    /// Presenting a new token for a subject that already has a live session
    /// refreshes that session and invalidates its cached credentials.
    ///
    /// # Errors
    ///
    /// Any verification error from [`TokenVerifier::verify`]. Every failure is
    /// audited as `authn_failure`.
    pub async fn authenticate(&self, raw_token: &str) -> AuthResult<(Session, Principal)> {
        let now = self.clock.now();

        let resolved = self
            .verifier
            .verify(raw_token, now)
            .await
            .and_then(|verified| Ok((self.issuer_config(&verified.issuer_name)?, verified)));
        let (issuer, verified) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.authentication_failed(e, now)),
        };

        let principal = map_principal(issuer, &verified.claims);
        let bearer = BearerCredential::new(raw_token, verified.expires_at);
        let session = self.sessions.upsert(principal.clone(), bearer, now);

        auth_metrics::record_authentication(&issuer.name, "success");
        self.audit.record(
            &AuditEvent::new(AuditEventKind::AuthnSuccess, SOURCE_AUTHENTICATE, now)
                .with_subject(principal.subject())
                .with_detail("issuer", principal.issuer())
                .with_detail("session_id", session.id().to_string())
                .with_detail("roles", join(principal.roles())),
        );

        Ok((session, principal))
    }

    /// Obtain a credential for `audience` on behalf of the session's principal
    ///
    /// Served from the encrypted cache when an entry exists for the session,
    /// the audience and the session's current bearer token. Otherwise the
    /// bearer token is exchanged and the result cached, provided the session
    /// still holds the same bearer token when the exchange returns.
    ///
    /// # Errors
    ///
    /// - [`AuthError::SessionNotFound`] for unknown or expired sessions
    /// - [`AuthError::TokenExpired`] when the session's bearer token has expired
    /// - any error from [`TokenExchangeClient::exchange`]
    pub async fn exchange(
        &self,
        session_id: &SessionId,
        audience: &str,
    ) -> AuthResult<DerivedCredential> {
        let now = self.clock.now();

        let (session, bearer) = match self.sessions.touch_with_bearer(session_id, now) {
            Ok(found) => found,
            Err(e) => return Err(self.exchange_failed(None, audience, "none", e, now)),
        };
        let subject = session.principal().subject();

        if bearer.expires_at() <= now {
            return Err(self.exchange_failed(
                Some(subject),
                audience,
                "none",
                AuthError::TokenExpired,
                now,
            ));
        }

        let fingerprint = bearer.fingerprint();
        let lookup = self.cache.get(session_id, audience, &fingerprint, now);
        let cache_outcome = lookup.label();
        if let CacheLookup::Hit(credential) = lookup {
            self.audit.record(
                &AuditEvent::new(AuditEventKind::CacheHit, SOURCE_EXCHANGE, now)
                    .with_subject(subject)
                    .with_detail("audience", audience)
                    .with_detail("session_id", session_id.to_string()),
            );
            return Ok(credential);
        }

        let issuer = match self.issuer_config(session.principal().issuer()) {
            Ok(issuer) => issuer,
            Err(e) => return Err(self.exchange_failed(Some(subject), audience, cache_outcome, e, now)),
        };

        let credential = match self
            .exchange_client
            .exchange(bearer.token(), audience, issuer, now)
            .await
        {
            Ok(credential) => credential,
            Err(e) => return Err(self.exchange_failed(Some(subject), audience, cache_outcome, e, now)),
        };

        let committed_at = self.clock.now();
        let cached = match self
            .sessions
            .commit_credential(session_id, &fingerprint, &credential, committed_at)
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(session_id = %session_id, audience, "Session changed during exchange, credential not cached");
                false
            }
            Err(e) => {
                warn!(session_id = %session_id, audience, error = %e, "Failed to cache derived credential");
                false
            }
        };

        self.audit.record(
            &AuditEvent::new(AuditEventKind::ExchangeSuccess, SOURCE_EXCHANGE, committed_at)
                .with_subject(subject)
                .with_detail("audience", audience)
                .with_detail("session_id", session_id.to_string())
                .with_detail("cache", cache_outcome)
                .with_detail("cached", cached.to_string())
                .with_detail("expires_at", to_unix(credential.expires_at).to_string()),
        );

        Ok(credential)
    }

    /// Cache-only lookup that never calls the token endpoint
    ///
    /// Audited as `cache_hit` or `cache_miss`.
    ///
    /// # Errors
    ///
    /// [`AuthError::SessionNotFound`] for unknown or expired sessions.
    pub fn cached(
        &self,
        session_id: &SessionId,
        audience: &str,
    ) -> AuthResult<Option<DerivedCredential>> {
        let now = self.clock.now();
        let session = self.sessions.get(session_id, now)?;

        let lookup = self.cache.get(session_id, audience, &session.fingerprint(), now);
        let kind = match lookup {
            CacheLookup::Hit(_) => AuditEventKind::CacheHit,
            _ => AuditEventKind::CacheMiss,
        };
        self.audit.record(
            &AuditEvent::new(kind, SOURCE_EXCHANGE, now)
                .with_subject(session.principal().subject())
                .with_detail("audience", audience)
                .with_detail("session_id", session_id.to_string())
                .with_detail("cache", lookup.label()),
        );

        Ok(lookup.into_credential())
    }

    /// End a session and drop every credential cached for it
    ///
    /// # Errors
    ///
    /// [`AuthError::SessionNotFound`] when no such session exists.
    pub fn logout(&self, session_id: &SessionId) -> AuthResult<Session> {
        let session = self.sessions.remove(session_id)?;
        let now = self.clock.now();

        info!(session_id = %session_id, "Session terminated");
        self.audit.record(
            &AuditEvent::new(AuditEventKind::SessionTerminated, SOURCE_LOGOUT, now)
                .with_subject(session.principal().subject())
                .with_detail("issuer", session.principal().issuer())
                .with_detail("session_id", session_id.to_string())
                .with_detail("reason", "logout"),
        );

        Ok(session)
    }

    /// Look up a live session
    ///
    /// # Errors
    ///
    /// [`AuthError::SessionNotFound`] for unknown or expired sessions.
    pub fn session(&self, session_id: &SessionId) -> AuthResult<Session> {
        self.sessions.get(session_id, self.clock.now())
    }

    /// Evict expired sessions and cache entries; returns `(sessions, entries)`
    pub fn sweep(&self) -> (usize, usize) {
        let now = self.clock.now();
        let sessions = self.sessions.sweep(now);
        let entries = self.cache.sweep(now);
        (sessions, entries)
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the current runtime
    ///
    /// Intervals shorter than [`MIN_MAINTENANCE_INTERVAL`] are raised to it.
    /// The task holds only a weak reference and ends once the orchestrator
    /// is dropped. Abort the handle to stop it earlier.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(MIN_MAINTENANCE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    debug!("Orchestrator dropped, maintenance task exiting");
                    break;
                };
                let (sessions, entries) = orchestrator.sweep();
                if sessions > 0 || entries > 0 {
                    debug!(sessions, entries, "Maintenance sweep evicted expired state");
                }
            }
        })
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn cache(&self) -> &EncryptedTokenCache {
        &self.cache
    }

    fn issuer_config(&self, name: &str) -> AuthResult<&TrustedIssuer> {
        self.verifier
            .issuer(name)
            .map(|issuer| &**issuer)
            .ok_or_else(|| AuthError::Configuration(format!("issuer '{name}' is not configured")))
    }

    fn authentication_failed(&self, error: AuthError, now: SystemTime) -> AuthError {
        debug!(error = %error, "Bearer token rejected");
        auth_metrics::record_authentication(auth_metrics::UNMATCHED_ISSUER, error.kind().as_str());
        self.audit.record(
            &AuditEvent::new(AuditEventKind::AuthnFailure, SOURCE_AUTHENTICATE, now)
                .with_detail("error", error.kind().as_str())
                .with_detail("reason", error.to_string()),
        );
        error
    }

    fn exchange_failed(
        &self,
        subject: Option<&str>,
        audience: &str,
        cache_outcome: &str,
        error: AuthError,
        now: SystemTime,
    ) -> AuthError {
        let mut event = AuditEvent::new(AuditEventKind::ExchangeFailure, SOURCE_EXCHANGE, now)
            .with_detail("audience", audience)
            .with_detail("cache", cache_outcome)
            .with_detail("error", error.kind().as_str())
            .with_detail("reason", error.to_string());
        if let Some(subject) = subject {
            event = event.with_subject(subject);
        }
        self.audit.record(&event);
        error
    }
}

fn join(values: &std::collections::BTreeSet<String>) -> String {
    values.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
