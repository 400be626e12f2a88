//! # obo-auth - Bearer Token Verification and On-Behalf-Of Delegation
//!
//! The trust boundary of a backend that accepts bearer tokens from one or
//! more external identity providers and, on behalf of the verified caller,
//! exchanges them for narrower tokens scoped to individual downstream
//! systems.
//!
//! ## Design Principles
//!
//! - **Fail Closed**: every check that cannot complete rejects the token
//! - **Asymmetric Only**: `none` and HMAC algorithms are never accepted
//! - **Bound Cache Entries**: exchanged tokens are sealed with AES-256-GCM
//!   under associated data naming the session, the audience and the bearer
//!   token they were obtained with
//! - **No Global State**: key caches, sessions and audit sinks are owned by
//!   the [`AuthenticationOrchestrator`] instance
//!
//! ## Architecture
//!
//! - [`jwt`] - Multi-issuer JWS verification with per-issuer JWKS caching
//! - [`claims`] - Claim paths and claim-to-role mapping
//! - [`session`] - Session registry keyed by `(issuer, subject)`
//! - [`cache`] - Encrypted cache for exchanged credentials
//! - [`exchange`] - RFC 8693 token exchange client
//! - [`orchestrator`] - The `authenticate` / `exchange` entry point
//! - [`audit`] - Structured audit events and sinks
//! - [`config`] - Configuration types and validation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use obo_auth::{AuthenticationOrchestrator, CoreConfig};
//! use obo_auth::audit::TracingAuditSink;
//!
//! # async fn run(config_json: &str, bearer: &str) -> obo_auth::AuthResult<()> {
//! let orchestrator = AuthenticationOrchestrator::new(CoreConfig::from_json_str(config_json)?)?
//!     .with_audit_sink(Arc::new(TracingAuditSink::new("orders-api")));
//!
//! let (session, principal) = orchestrator.authenticate(bearer).await?;
//! if principal.has_role("svc-admin") {
//!     let credential = orchestrator.exchange(&session.id(), "urn:db:primary").await?;
//!     println!("derived token valid until {:?}", credential.expires_at);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `metrics` - Counters for authentications, exchanges and cache lookups
//!
//! ## Standards Compliance
//!
//! - **RFC 7515** - JSON Web Signature (JWS)
//! - **RFC 7517** - JSON Web Key (JWK)
//! - **RFC 7519** - JSON Web Token (JWT)
//! - **RFC 8693** - OAuth 2.0 Token Exchange

pub mod audit;
mod auth_metrics;
pub mod cache;
pub mod claims;
pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod jwt;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod types;

#[doc(inline)]
pub use config::{
    CacheConfig, ClaimMappings, ClientAuthMethod, CoreConfig, ExchangeConfig, SessionConfig,
    TrustedIssuer, VerifierConfig,
};

#[doc(inline)]
pub use error::{AuthError, AuthResult, ErrorKind};

#[doc(inline)]
pub use types::{DerivedCredential, Principal, UNASSIGNED_ROLE};

#[doc(inline)]
pub use orchestrator::AuthenticationOrchestrator;

#[doc(inline)]
pub use session::{Session, SessionId};

pub use audit::{AuditEvent, AuditEventKind, AuditSink};
pub use auth_metrics::init_auth_metrics;
pub use clock::{Clock, SystemClock};
