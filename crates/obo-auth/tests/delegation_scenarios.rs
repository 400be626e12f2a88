//! End-to-end authenticate / exchange scenarios
//!
//! Each test runs the orchestrator against a mock identity provider that
//! publishes a real P-256 key and answers RFC 8693 exchanges. Token endpoint
//! call counts are enforced with wiremock expectations.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    ManualClock, MockIdentityProvider, RecordingAuditSink, core_config, db_claims, derived_token,
};
use obo_auth::{AuditEventKind, AuthError, AuthenticationOrchestrator, Clock, UNASSIGNED_ROLE};
use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;

const API_AUDIENCE: &str = "api://backend";
const DB_AUDIENCE: &str = "urn:db:primary";

struct Harness {
    idp: MockIdentityProvider,
    clock: Arc<ManualClock>,
    audit: Arc<RecordingAuditSink>,
    orchestrator: AuthenticationOrchestrator,
}

async fn harness() -> Harness {
    harness_with(MockIdentityProvider::start().await)
}

fn harness_with(idp: MockIdentityProvider) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let audit = Arc::new(RecordingAuditSink::default());
    let orchestrator =
        AuthenticationOrchestrator::new(core_config(vec![idp.trusted_issuer("corp", API_AUDIENCE)]))
            .unwrap()
            .with_clock(clock.clone())
            .with_audit_sink(audit.clone());

    Harness {
        idp,
        clock,
        audit,
        orchestrator,
    }
}

impl Harness {
    fn bearer(&self, subject: &str, roles: &[&str]) -> String {
        self.idp
            .sign(&self.idp.claims(subject, API_AUDIENCE, roles, self.clock.now()))
    }
}

/// Cold then warm: exactly one exchange and one cached entry, then zero exchanges
#[tokio::test]
async fn test_svc_admin_cold_then_warm_cache() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp.mock_exchange(&derived, 600, 1).await;

    let (session, principal) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    assert!(principal.has_role("svc-admin"));
    assert_eq!(principal.issuer(), "corp");

    let cold = h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
    assert_eq!(cold.token.expose_secret(), &derived);
    assert_eq!(cold.audience, DB_AUDIENCE);
    assert_eq!(cold.roles, vec!["db_owner".to_string()]);
    assert_eq!(cold.claim_str("legacy_name"), Some("CORP\\svc-admin"));
    assert_eq!(cold.claim_str("db_user"), Some("svc_admin"));
    assert_eq!(h.orchestrator.cache().len(), 1);

    let warm = h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
    assert_eq!(warm.token.expose_secret(), &derived);
    assert_eq!(warm.expires_at, cold.expires_at);

    assert_eq!(
        h.audit.kinds(),
        vec![
            AuditEventKind::AuthnSuccess,
            AuditEventKind::ExchangeSuccess,
            AuditEventKind::CacheHit,
        ]
    );
    let exchanged = &h.audit.events()[1];
    assert_eq!(exchanged.detail("cache"), Some("miss"));
    assert_eq!(exchanged.detail("cached"), Some("true"));
    assert_eq!(exchanged.subject.as_deref(), Some("alice"));

    h.idp.server.verify().await;
}

/// A refreshed bearer token keeps the session but misses the cache once
#[tokio::test]
async fn test_refreshed_bearer_forces_one_new_exchange() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp.mock_exchange(&derived, 600, 2).await;

    let (first, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    h.orchestrator.exchange(&first.id(), DB_AUDIENCE).await.unwrap();
    h.orchestrator.exchange(&first.id(), DB_AUDIENCE).await.unwrap();

    h.clock.advance(Duration::from_secs(30));
    let (refreshed, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    assert_eq!(refreshed.id(), first.id());
    assert_ne!(refreshed.fingerprint(), first.fingerprint());
    assert!(h.orchestrator.cache().is_empty());

    h.orchestrator.exchange(&refreshed.id(), DB_AUDIENCE).await.unwrap();
    h.orchestrator.exchange(&refreshed.id(), DB_AUDIENCE).await.unwrap();

    let kinds = h.audit.kinds();
    assert_eq!(
        kinds.iter().filter(|k| **k == AuditEventKind::ExchangeSuccess).count(),
        2
    );
    assert_eq!(
        kinds.iter().filter(|k| **k == AuditEventKind::CacheHit).count(),
        2
    );

    h.idp.server.verify().await;
}

/// Audiences are cached independently within one session
#[tokio::test]
async fn test_each_audience_exchanged_once() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp.mock_exchange(&derived, 600, 2).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    for _ in 0..3 {
        h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
        h.orchestrator
            .exchange(&session.id(), "urn:ldap:corp")
            .await
            .unwrap();
    }
    assert_eq!(h.orchestrator.cache().len(), 2);

    h.idp.server.verify().await;
}

/// Sessions of different subjects never share cached credentials
#[tokio::test]
async fn test_sessions_do_not_share_entries() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp.mock_exchange(&derived, 600, 2).await;

    let (alice, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    let (bob, _) = h
        .orchestrator
        .authenticate(&h.bearer("bob", &["Admins"]))
        .await
        .unwrap();
    assert_ne!(alice.id(), bob.id());

    h.orchestrator.exchange(&alice.id(), DB_AUDIENCE).await.unwrap();
    assert!(h.orchestrator.cached(&bob.id(), DB_AUDIENCE).unwrap().is_none());
    assert_eq!(h.audit.last().kind, AuditEventKind::CacheMiss);

    h.orchestrator.exchange(&bob.id(), DB_AUDIENCE).await.unwrap();
    assert!(h.orchestrator.cached(&bob.id(), DB_AUDIENCE).unwrap().is_some());
    assert_eq!(h.audit.last().kind, AuditEventKind::CacheHit);

    h.idp.server.verify().await;
}

/// An expired derived credential is replaced lazily on the next exchange
#[tokio::test]
async fn test_expired_entry_refreshed_on_next_exchange() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 3600));
    h.idp.mock_exchange(&derived, 60, 2).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    let first = h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
    assert_eq!(
        first.expires_at,
        h.clock.now() + Duration::from_secs(60),
        "expires_in bounds the credential lifetime"
    );

    h.clock.advance(Duration::from_secs(61));
    h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
    assert_eq!(h.audit.last().kind, AuditEventKind::ExchangeSuccess);
    assert_eq!(h.audit.last().detail("cache"), Some("expired"));

    h.idp.server.verify().await;
}

/// Cache entry lifetime never exceeds the derived token's own expiry
#[tokio::test]
async fn test_entry_ttl_bounded_by_credential_expiry() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 45));
    h.idp.mock_exchange(&derived, 3600, 1).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    let credential = h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
    assert_eq!(credential.expires_at, h.clock.now() + Duration::from_secs(45));

    let entry_expiry = h
        .orchestrator
        .cache()
        .entry_expiry(&session.id(), DB_AUDIENCE)
        .unwrap();
    assert!(entry_expiry <= credential.expires_at);

    h.idp.server.verify().await;
}

#[tokio::test]
async fn test_logout_drops_session_and_entries() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp.mock_exchange(&derived, 600, 1).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
    assert_eq!(h.orchestrator.cache().len(), 1);

    h.orchestrator.logout(&session.id()).unwrap();
    assert!(h.orchestrator.cache().is_empty());
    let terminated = h.audit.last();
    assert_eq!(terminated.kind, AuditEventKind::SessionTerminated);
    assert_eq!(terminated.detail("reason"), Some("logout"));

    assert_eq!(
        h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap_err(),
        AuthError::SessionNotFound
    );
    assert_eq!(h.audit.last().kind, AuditEventKind::ExchangeFailure);

    h.idp.server.verify().await;
}

/// The bearer token is never sent once it has expired
#[tokio::test]
async fn test_expired_bearer_is_not_exchanged() {
    let h = harness().await;
    h.idp.mock_exchange("unused", 600, 0).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();

    // Bearer lives one hour; the session idles out after thirty minutes unless touched.
    h.clock.advance(Duration::from_secs(1500));
    h.orchestrator.session(&session.id()).unwrap();
    h.orchestrator.sessions().touch(&session.id(), h.clock.now()).unwrap();
    h.clock.advance(Duration::from_secs(1500));
    h.orchestrator.sessions().touch(&session.id(), h.clock.now()).unwrap();
    h.clock.advance(Duration::from_secs(700));

    let err = h
        .orchestrator
        .exchange(&session.id(), DB_AUDIENCE)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::TokenExpired);
    assert_eq!(h.audit.last().detail("error"), Some("token_expired"));

    h.idp.server.verify().await;
}

#[tokio::test]
async fn test_idle_session_expires() {
    let h = harness().await;
    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(1801));
    assert_eq!(
        h.orchestrator.session(&session.id()).unwrap_err(),
        AuthError::SessionNotFound
    );
    assert!(h.orchestrator.sessions().is_empty());
}

/// 4xx responses are final and audited without a cache write
#[tokio::test]
async fn test_rejected_exchange_not_retried() {
    let h = harness().await;
    h.idp.mock_exchange_error(400, "invalid_target", 1).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .exchange(&session.id(), DB_AUDIENCE)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        AuthError::ExchangeRejected {
            status: 400,
            reason: "invalid_target".to_string()
        }
    );
    assert!(h.orchestrator.cache().is_empty());
    let failure = h.audit.last();
    assert_eq!(failure.kind, AuditEventKind::ExchangeFailure);
    assert_eq!(failure.detail("error"), Some("exchange_rejected"));
    assert_eq!(failure.detail("cache"), Some("miss"));

    h.idp.server.verify().await;
}

#[tokio::test]
async fn test_unavailable_exchange_retried_then_fails() {
    let h = harness().await;
    h.idp.mock_exchange_error(503, "temporarily_unavailable", 3).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .exchange(&session.id(), DB_AUDIENCE)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::ExchangeUnavailable(_)));
    assert!(err.is_retryable());

    h.idp.server.verify().await;
}

#[tokio::test]
async fn test_unmapped_roles_yield_unassigned() {
    let h = harness().await;
    let (_, principal) = h
        .orchestrator
        .authenticate(&h.bearer("carol", &["Contractors"]))
        .await
        .unwrap();

    assert!(principal.is_unassigned());
    assert!(principal.has_role(UNASSIGNED_ROLE));
    assert_eq!(principal.roles().len(), 1);
    assert!(principal.has_scope("db.read"));
}

#[tokio::test]
async fn test_one_external_role_maps_to_many() {
    let h = harness().await;
    let (_, principal) = h
        .orchestrator
        .authenticate(&h.bearer("dave", &["Readers", "Unknown"]))
        .await
        .unwrap();

    assert!(principal.has_role("db-reader"));
    assert!(principal.has_role("auditor"));
    assert!(!principal.is_unassigned());
    assert_eq!(principal.roles().len(), 2);
}

#[tokio::test]
async fn test_maintenance_sweeps_expired_state() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp.mock_exchange(&derived, 600, 1).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();

    h.clock.advance(Duration::from_secs(1801));
    let orchestrator = Arc::new(h.orchestrator);
    let handle = orchestrator.spawn_maintenance(Duration::from_millis(10));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !orchestrator.sessions().is_empty() || !orchestrator.cache().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    handle.abort();

    h.idp.server.verify().await;
}

/// An issuer-supplied lifetime beyond the representable range is an invalid response
#[tokio::test]
async fn test_unrepresentable_expires_in_is_invalid_response() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp.mock_exchange(&derived, u64::MAX, 1).await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .exchange(&session.id(), DB_AUDIENCE)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::InvalidExchangeResponse(_)));
    assert!(h.orchestrator.cache().is_empty());
    assert_eq!(
        h.audit.last().detail("error"),
        Some("invalid_exchange_response")
    );

    h.idp.server.verify().await;
}

/// A bearer refreshed while an exchange is in flight keeps that exchange out of the cache
#[tokio::test]
async fn test_bearer_refreshed_during_exchange_discards_result() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp
        .mock_exchange_delayed(&derived, 600, Duration::from_millis(300), 2)
        .await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    let refreshed_bearer = h.bearer("alice", &["Admins"]);

    let session_id = session.id();
    let (exchanged, refreshed) = tokio::join!(
        h.orchestrator.exchange(&session_id, DB_AUDIENCE),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.orchestrator.authenticate(&refreshed_bearer).await
        }
    );

    let credential = exchanged.unwrap();
    assert_eq!(credential.token.expose_secret(), &derived);
    let (refreshed, _) = refreshed.unwrap();
    assert_eq!(refreshed.id(), session.id());
    assert_ne!(refreshed.fingerprint(), session.fingerprint());

    assert!(h.orchestrator.cache().is_empty());
    let exchanged_event = h.audit.last();
    assert_eq!(exchanged_event.kind, AuditEventKind::ExchangeSuccess);
    assert_eq!(exchanged_event.detail("cached"), Some("false"));

    // The next exchange goes back to the token endpoint under the new bearer
    h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
    assert_eq!(h.orchestrator.cache().len(), 1);
    assert_eq!(h.audit.last().detail("cache"), Some("miss"));

    h.idp.server.verify().await;
}

/// Dropping an in-flight exchange commits nothing
#[tokio::test]
async fn test_cancelled_exchange_leaves_no_cache_entry() {
    let h = harness().await;
    let derived = derived_token(&db_claims(h.clock.now(), 900));
    h.idp
        .mock_exchange_delayed(&derived, 600, Duration::from_millis(500), 1..=2u64)
        .await;

    let (session, _) = h
        .orchestrator
        .authenticate(&h.bearer("alice", &["Admins"]))
        .await
        .unwrap();
    let events_before = h.audit.events().len();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        h.orchestrator.exchange(&session.id(), DB_AUDIENCE),
    )
    .await;
    assert!(cancelled.is_err());

    assert!(h.orchestrator.cache().is_empty());
    assert_eq!(h.audit.events().len(), events_before);
    let current = h.orchestrator.session(&session.id()).unwrap();
    assert_eq!(current.fingerprint(), session.fingerprint());

    h.orchestrator.exchange(&session.id(), DB_AUDIENCE).await.unwrap();
    assert_eq!(h.orchestrator.cache().len(), 1);

    h.idp.server.verify().await;
}

/// Dropping an in-flight authentication creates no session
#[tokio::test]
async fn test_cancelled_authenticate_creates_no_session() {
    let h = harness_with(
        MockIdentityProvider::start_with_jwks_delay(Duration::from_millis(500)).await,
    );
    let bearer = h.bearer("alice", &["Admins"]);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        h.orchestrator.authenticate(&bearer),
    )
    .await;
    assert!(cancelled.is_err());
    assert!(h.orchestrator.sessions().is_empty());
    assert!(h.audit.events().is_empty());

    let (session, _) = h.orchestrator.authenticate(&bearer).await.unwrap();
    assert_eq!(h.orchestrator.sessions().len(), 1);
    assert_eq!(h.orchestrator.session(&session.id()).unwrap().id(), session.id());
}
