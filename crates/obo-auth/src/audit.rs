//! Structured audit events for authentication and delegation
//!
//! The orchestrator emits one [`AuditEvent`] per `authenticate` call, one per
//! `exchange` call and one per logout. Events are handed to an injected
//! [`AuditSink`]; when none is configured, [`NoopAuditSink`] drops them.
//!
//! Events never carry raw tokens, client secrets or key material. Details hold
//! issuer names, audiences, error kinds and cache outcomes only.
//!
//! ## Usage
//!
//! ```rust
//! use obo_auth::audit::{AuditEvent, AuditEventKind, AuditSink, TracingAuditSink};
//! use std::time::SystemTime;
//!
//! let sink = TracingAuditSink::privacy_focused("orders-api");
//!
//! sink.record(
//!     &AuditEvent::new(AuditEventKind::AuthnSuccess, "authenticate", SystemTime::now())
//!         .with_subject("user-42")
//!         .with_detail("issuer", "corp"),
//! );
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Bearer token verified and session established
    AuthnSuccess,
    /// Bearer token rejected
    AuthnFailure,
    /// Derived credential obtained from the token endpoint
    ExchangeSuccess,
    /// Derived credential could not be obtained
    ExchangeFailure,
    /// Derived credential served from the encrypted cache
    CacheHit,
    /// Cache-only lookup found nothing usable
    CacheMiss,
    /// Session removed by logout
    SessionTerminated,
}

impl AuditEventKind {
    /// Stable snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthnSuccess => "authn_success",
            Self::AuthnFailure => "authn_failure",
            Self::ExchangeSuccess => "exchange_success",
            Self::ExchangeFailure => "exchange_failure",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::SessionTerminated => "session_terminated",
        }
    }

    /// Whether the event records a rejected operation
    pub fn is_failure(self) -> bool {
        matches!(self, Self::AuthnFailure | Self::ExchangeFailure)
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event id (time-ordered)
    pub id: Uuid,
    #[serde(with = "system_time_serde")]
    pub timestamp: SystemTime,
    pub kind: AuditEventKind,
    /// Subject of the principal, when one is known
    pub subject: Option<String>,
    /// Operation that produced the event
    pub source: String,
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, source: impl Into<String>, timestamp: SystemTime) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp,
            kind,
            subject: None,
            source: source.into(),
            details: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

/// Destination for audit events
///
/// Implementations must not block: `record` is called inline on the
/// authentication path.
pub trait AuditSink: Send + Sync + fmt::Debug {
    fn record(&self, event: &AuditEvent);
}

/// Sink that discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

/// Sink that writes events to `tracing` under the `audit::auth` target
///
/// Failures are logged at `WARN`, everything else at `INFO`. In privacy mode
/// subjects are replaced by a truncated BLAKE3 digest so events stay
/// correlatable without naming the user.
#[derive(Debug, Clone)]
pub struct TracingAuditSink {
    service_name: String,
    hash_identifiers: bool,
}

impl TracingAuditSink {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            hash_identifiers: false,
        }
    }

    /// Sink that hashes subjects
    pub fn privacy_focused(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            hash_identifiers: true,
        }
    }

    #[must_use]
    pub fn with_identifier_hashing(mut self, hash: bool) -> Self {
        self.hash_identifiers = hash;
        self
    }

    fn maybe_hash(&self, value: &str) -> String {
        if self.hash_identifiers {
            let hash = blake3::hash(value.as_bytes());
            format!("blake3:{}", &hash.to_hex()[..16])
        } else {
            value.to_string()
        }
    }
}

impl Default for TracingAuditSink {
    fn default() -> Self {
        Self::new("obo-auth")
    }
}

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let subject = event.subject.as_deref().map(|s| self.maybe_hash(s));
        let details = serde_json::to_string(&event.details).unwrap_or_default();

        if event.kind.is_failure() {
            warn!(
                target: "audit::auth",
                audit_id = %event.id,
                event_type = %event.kind,
                subject = ?subject,
                source = %event.source,
                details = %details,
                service = %self.service_name,
                "Audit event"
            );
        } else {
            info!(
                target: "audit::auth",
                audit_id = %event.id,
                event_type = %event.kind,
                subject = ?subject,
                source = %event.source,
                details = %details,
                service = %self.service_name,
                "Audit event"
            );
        }
    }
}

mod system_time_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        UNIX_EPOCH
            .checked_add(Duration::from_secs(secs))
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}
