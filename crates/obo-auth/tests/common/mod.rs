//! Common test utilities for integration tests
//!
//! Provides a mock identity provider (JWKS + token endpoint) backed by an
//! ephemeral P-256 signing key, a manually driven clock and an audit sink
//! that records every event.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use obo_auth::audit::{AuditEvent, AuditEventKind, AuditSink};
use obo_auth::claims::ClaimPath;
use obo_auth::config::{
    CacheConfig, ClaimMappings, ClientAuthMethod, CoreConfig, ExchangeConfig, SessionConfig,
    TrustedIssuer, VerifierConfig,
};
use obo_auth::retry::RetryConfig;
use obo_auth::Clock;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use secrecy::SecretString;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate, Times};

/// Ephemeral ES256 signing key with its public JWK
pub struct SigningKey {
    pub kid: String,
    pkcs8: Vec<u8>,
    public_point: Vec<u8>,
}

impl SigningKey {
    pub fn generate(kid: &str) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .expect("P-256 key generation");
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .expect("P-256 key parse");

        Self {
            kid: kid.to_string(),
            pkcs8: pkcs8.as_ref().to_vec(),
            public_point: pair.public_key().as_ref().to_vec(),
        }
    }

    /// Public key as a JWK; the point is `0x04 || x || y`
    pub fn jwk(&self) -> Value {
        let (x, y) = self.public_point[1..].split_at(32);
        json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": self.kid,
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        })
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_ec_der(&self.pkcs8))
            .expect("ES256 signing")
    }
}

/// Mock identity provider serving `/jwks` and `/token`
pub struct MockIdentityProvider {
    pub server: MockServer,
    pub key: SigningKey,
    pub issuer: String,
}

impl MockIdentityProvider {
    /// Start the server and publish the signing key
    pub async fn start() -> Self {
        Self::start_with_jwks_delay(Duration::ZERO).await
    }

    /// Start the server with a JWKS endpoint that answers after `delay`
    pub async fn start_with_jwks_delay(delay: Duration) -> Self {
        let server = MockServer::start().await;
        let key = SigningKey::generate("idp-key-1");

        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "keys": [key.jwk()] }))
                    .set_delay(delay),
            )
            .mount(&server)
            .await;

        let issuer = server.uri();
        Self {
            server,
            key,
            issuer,
        }
    }

    pub fn jwks_uri(&self) -> String {
        format!("{}/jwks", self.server.uri())
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/token", self.server.uri())
    }

    /// Standard claims for `subject`, valid for an hour from `now`
    pub fn claims(&self, subject: &str, audience: &str, roles: &[&str], now: SystemTime) -> Value {
        let now = unix(now);
        json!({
            "iss": self.issuer,
            "aud": audience,
            "sub": subject,
            "roles": roles,
            "scope": "db.read db.write",
            "iat": now,
            "nbf": now,
            "exp": now + 3600,
            "jti": uuid_like(now),
        })
    }

    pub fn sign(&self, claims: &Value) -> String {
        self.key.sign(claims)
    }

    /// Token endpoint answering every exchange with `derived_token`
    ///
    /// Panics on drop of the server when the call count differs from `expected_calls`.
    pub async fn mock_exchange(&self, derived_token: &str, expires_in: u64, expected_calls: u64) {
        self.mock_exchange_delayed(derived_token, expires_in, Duration::ZERO, expected_calls)
            .await;
    }

    /// Like [`mock_exchange`](Self::mock_exchange), answering after `delay`
    pub async fn mock_exchange_delayed(
        &self,
        derived_token: &str,
        expires_in: u64,
        delay: Duration,
        expected_calls: impl Into<Times>,
    ) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "access_token": derived_token,
                        "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
                        "token_type": "Bearer",
                        "expires_in": expires_in,
                    }))
                    .set_delay(delay),
            )
            .expect(expected_calls)
            .mount(&self.server)
            .await;
    }

    pub async fn mock_exchange_error(&self, status: u16, error: &str, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "error": error,
                "error_description": "rejected by test",
            })))
            .expect(expected_calls)
            .mount(&self.server)
            .await;
    }

    /// Issuer configuration accepting `audience`, mapping `Admins` to `svc-admin`
    pub fn trusted_issuer(&self, name: &str, audience: &str) -> TrustedIssuer {
        TrustedIssuer {
            name: name.to_string(),
            issuer: self.issuer.clone(),
            audiences: vec![audience.to_string()],
            jwks_uri: self.jwks_uri(),
            allowed_algorithms: vec![Algorithm::ES256],
            claim_mappings: ClaimMappings::default(),
            role_mappings: HashMap::from([
                ("Admins".to_string(), vec!["svc-admin".to_string()]),
                (
                    "Readers".to_string(),
                    vec!["db-reader".to_string(), "auditor".to_string()],
                ),
            ]),
            exchange: Some(ExchangeConfig {
                token_endpoint: self.token_endpoint(),
                client_id: "backend".to_string(),
                client_secret: SecretString::new("s3cret".to_string()),
                auth_method: ClientAuthMethod::ClientSecretBasic,
                scope: None,
                requested_token_type: None,
                required_claim: Some(ClaimPath::key("legacy_name")),
                roles_claim: ClaimPath::key("roles"),
                passthrough_claims: vec![ClaimPath::key("db_user")],
            }),
        }
    }
}

/// Configuration with fast retries and default limits
pub fn core_config(issuers: Vec<TrustedIssuer>) -> CoreConfig {
    CoreConfig {
        issuers,
        cache: CacheConfig::default(),
        session: SessionConfig::default(),
        verifier: VerifierConfig {
            jwks_retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
                ..RetryConfig::default()
            },
            ..VerifierConfig::default()
        },
        exchange_retry: RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..RetryConfig::default()
        },
    }
}

/// Derivative token as issued to the downstream system (signature unchecked)
pub fn derived_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

/// Derived token claims for `urn:db:primary`
pub fn db_claims(now: SystemTime, lifetime_secs: u64) -> Value {
    json!({
        "aud": "urn:db:primary",
        "sub": "svc-admin",
        "exp": unix(now) + lifetime_secs,
        "roles": ["db_owner"],
        "legacy_name": "CORP\\svc-admin",
        "db_user": "svc_admin",
    })
}

pub fn unix(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn uuid_like(seed: u64) -> String {
    format!("{seed:x}-{:x}", fastrand::u64(..))
}

/// Clock advanced explicitly by the test
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    /// Clock at the current whole second
    pub fn new() -> Self {
        Self {
            now: Mutex::new(UNIX_EPOCH + Duration::from_secs(unix(SystemTime::now()))),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// Audit sink keeping every event for assertions
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }

    pub fn last(&self) -> AuditEvent {
        self.events().last().cloned().expect("at least one audit event")
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
