//! Configuration types
//!
//! Configuration is consumed as an already-loaded document: callers read the
//! file (or environment, or secret store) and hand the JSON to
//! [`CoreConfig::from_json_str`], or build the structs directly.
//! [`CoreConfig::validate`] runs before any component is constructed.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use jsonwebtoken::Algorithm;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::claims::ClaimPath;
use crate::error::{AuthError, AuthResult};
use crate::retry::RetryConfig;

/// Longest configurable lifetime, skew or timeout (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Top-level configuration for the authentication core
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Trusted token issuers
    pub issuers: Vec<TrustedIssuer>,
    /// Exchanged-token cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Token verification settings
    #[serde(default)]
    pub verifier: VerifierConfig,
    /// Retry policy for token exchange calls
    #[serde(default)]
    pub exchange_retry: RetryConfig,
}

/// An identity provider whose tokens are accepted
///
/// Matched by the `(iss, aud)` pair carried in the token. Each pair may be
/// claimed by exactly one issuer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustedIssuer {
    /// Unique configuration name, reported as [`Principal::issuer`](crate::Principal::issuer)
    pub name: String,
    /// Exact `iss` value
    pub issuer: String,
    /// Accepted `aud` values
    pub audiences: Vec<String>,
    /// JWKS endpoint
    pub jwks_uri: String,
    /// Accepted signing algorithms (asymmetric only)
    #[serde(default = "default_algorithms")]
    pub allowed_algorithms: Vec<Algorithm>,
    /// Where to find subject, roles, scopes and passthrough claims
    #[serde(default)]
    pub claim_mappings: ClaimMappings,
    /// External role -> internal roles
    #[serde(default)]
    pub role_mappings: HashMap<String, Vec<String>>,
    /// On-behalf-of exchange settings; absent when this issuer cannot exchange
    #[serde(default)]
    pub exchange: Option<ExchangeConfig>,
}

fn default_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::ES256, Algorithm::RS256, Algorithm::PS256]
}

/// Claim locations inside a verified token
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClaimMappings {
    /// Subject identifier
    pub subject: ClaimPath,
    /// External roles (string or array of strings)
    pub roles: ClaimPath,
    /// Scopes (space-delimited string or array of strings)
    pub scopes: ClaimPath,
    /// Claims copied verbatim onto the principal
    pub passthrough: Vec<ClaimPath>,
}

impl Default for ClaimMappings {
    fn default() -> Self {
        Self {
            subject: ClaimPath::key("sub"),
            roles: ClaimPath::key("roles"),
            scopes: ClaimPath::key("scope"),
            passthrough: Vec::new(),
        }
    }
}

/// How the core authenticates to the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// HTTP Basic authentication (RFC 6749 section 2.3.1)
    #[default]
    ClientSecretBasic,
    /// Credentials in the form body
    ClientSecretPost,
}

/// RFC 8693 token exchange settings for one issuer
#[derive(Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Token endpoint
    pub token_endpoint: String,
    /// Client identifier
    pub client_id: String,
    /// Client secret
    pub client_secret: SecretString,
    /// Client authentication method
    #[serde(default)]
    pub auth_method: ClientAuthMethod,
    /// Scope requested with every exchange
    #[serde(default)]
    pub scope: Option<String>,
    /// Requested token type; the issuer default when absent
    #[serde(default)]
    pub requested_token_type: Option<String>,
    /// Claim that must be present in the derived token
    #[serde(default)]
    pub required_claim: Option<ClaimPath>,
    /// Where the derived token carries its roles
    #[serde(default = "default_roles_claim")]
    pub roles_claim: ClaimPath,
    /// Claims copied from the derived token into the credential
    #[serde(default)]
    pub passthrough_claims: Vec<ClaimPath>,
}

fn default_roles_claim() -> ClaimPath {
    ClaimPath::key("roles")
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("auth_method", &self.auth_method)
            .field("scope", &self.scope)
            .field("requested_token_type", &self.requested_token_type)
            .field("required_claim", &self.required_claim)
            .field("roles_claim", &self.roles_claim)
            .field("passthrough_claims", &self.passthrough_claims)
            .finish()
    }
}

/// Exchanged-token cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on any entry's lifetime
    pub max_ttl_secs: u64,
    /// Maximum number of cached credentials
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_ttl_secs: 300,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    /// Upper bound on any entry's lifetime
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Evict a session this long after it was last seen
    pub idle_timeout_secs: u64,
    /// Evict a session this long after it was created, regardless of activity
    pub hard_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1_800,
            hard_ttl_secs: 28_800,
        }
    }
}

impl SessionConfig {
    /// Idle timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Hard lifetime
    pub fn hard_ttl(&self) -> Duration {
        Duration::from_secs(self.hard_ttl_secs)
    }
}

/// Token verification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Tolerance applied to `exp`, `nbf` and `iat`
    pub clock_skew_secs: u64,
    /// How long a fetched key set is trusted
    pub jwks_cache_ttl_secs: u64,
    /// Minimum spacing between forced key set refreshes
    pub jwks_min_refresh_interval_secs: u64,
    /// Timeout for outbound HTTP calls (key fetch and token exchange)
    pub http_timeout_secs: u64,
    /// Tokens longer than this are rejected before decoding
    pub max_token_bytes: usize,
    /// Retry policy for key set fetches
    pub jwks_retry: RetryConfig,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: 60,
            jwks_cache_ttl_secs: 600,
            jwks_min_refresh_interval_secs: 5,
            http_timeout_secs: 10,
            max_token_bytes: 8 * 1024,
            jwks_retry: RetryConfig::default(),
        }
    }
}

impl VerifierConfig {
    /// Clock skew tolerance
    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    /// Key set cache lifetime
    pub fn jwks_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.jwks_cache_ttl_secs)
    }

    /// Minimum spacing between forced refreshes
    pub fn jwks_min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.jwks_min_refresh_interval_secs)
    }

    /// Outbound HTTP timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Whether an algorithm verifies with a public key
pub fn is_asymmetric(algorithm: Algorithm) -> bool {
    !matches!(
        algorithm,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
    )
}

impl CoreConfig {
    /// Parse and validate a JSON configuration document
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] when the document does not parse
    /// or fails [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> AuthResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AuthError::Configuration(format!("invalid configuration document: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for internal consistency
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] naming the first problem found.
    pub fn validate(&self) -> AuthResult<()> {
        if self.issuers.is_empty() {
            return Err(config_error("at least one trusted issuer is required"));
        }

        let mut names = HashSet::new();
        let mut pairs = HashSet::new();
        for issuer in &self.issuers {
            issuer.validate()?;
            if !names.insert(issuer.name.as_str()) {
                return Err(config_error(format!(
                    "duplicate issuer name '{}'",
                    issuer.name
                )));
            }
            for audience in &issuer.audiences {
                if !pairs.insert((issuer.issuer.as_str(), audience.as_str())) {
                    return Err(config_error(format!(
                        "issuer '{}' with audience '{}' is configured more than once",
                        issuer.issuer, audience
                    )));
                }
            }
        }

        if self.cache.max_ttl_secs == 0 {
            return Err(config_error("cache.max_ttl_secs must be positive"));
        }
        if self.cache.max_entries == 0 {
            return Err(config_error("cache.max_entries must be positive"));
        }
        if self.session.idle_timeout_secs == 0 || self.session.hard_ttl_secs == 0 {
            return Err(config_error("session timeouts must be positive"));
        }
        for (field, secs) in [
            ("cache.max_ttl_secs", self.cache.max_ttl_secs),
            ("session.idle_timeout_secs", self.session.idle_timeout_secs),
            ("session.hard_ttl_secs", self.session.hard_ttl_secs),
            ("verifier.clock_skew_secs", self.verifier.clock_skew_secs),
            ("verifier.jwks_cache_ttl_secs", self.verifier.jwks_cache_ttl_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(config_error(format!(
                    "{field} must not exceed {MAX_DURATION_SECS}"
                )));
            }
        }
        if self.verifier.jwks_cache_ttl_secs == 0 {
            return Err(config_error("verifier.jwks_cache_ttl_secs must be positive"));
        }
        if self.verifier.http_timeout_secs == 0 {
            return Err(config_error("verifier.http_timeout_secs must be positive"));
        }
        if self.verifier.max_token_bytes == 0 {
            return Err(config_error("verifier.max_token_bytes must be positive"));
        }
        if self.exchange_retry.max_attempts == 0 || self.verifier.jwks_retry.max_attempts == 0 {
            return Err(config_error("retry max_attempts must be at least 1"));
        }

        Ok(())
    }

    /// Look up an issuer configuration by name
    pub fn issuer(&self, name: &str) -> Option<&TrustedIssuer> {
        self.issuers.iter().find(|i| i.name == name)
    }
}

impl TrustedIssuer {
    fn validate(&self) -> AuthResult<()> {
        if self.name.trim().is_empty() {
            return Err(config_error("issuer name must not be empty"));
        }
        if self.issuer.trim().is_empty() {
            return Err(config_error(format!(
                "issuer '{}': iss value must not be empty",
                self.name
            )));
        }
        if self.audiences.is_empty() || self.audiences.iter().any(|a| a.trim().is_empty()) {
            return Err(config_error(format!(
                "issuer '{}': at least one non-empty audience is required",
                self.name
            )));
        }
        require_secure_url(&self.jwks_uri, &format!("issuer '{}' jwks_uri", self.name))?;

        if self.allowed_algorithms.is_empty() {
            return Err(config_error(format!(
                "issuer '{}': allowed_algorithms must not be empty",
                self.name
            )));
        }
        if let Some(alg) = self
            .allowed_algorithms
            .iter()
            .find(|alg| !is_asymmetric(**alg))
        {
            return Err(config_error(format!(
                "issuer '{}': symmetric algorithm {:?} is not accepted",
                self.name, alg
            )));
        }

        if let Some(exchange) = &self.exchange {
            require_secure_url(
                &exchange.token_endpoint,
                &format!("issuer '{}' token_endpoint", self.name),
            )?;
            if exchange.client_id.trim().is_empty() {
                return Err(config_error(format!(
                    "issuer '{}': exchange client_id must not be empty",
                    self.name
                )));
            }
            if exchange.client_secret.expose_secret().is_empty() {
                return Err(config_error(format!(
                    "issuer '{}': exchange client_secret must not be empty",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// Whether `audience` is accepted for this issuer
    pub fn accepts_audience(&self, audience: &str) -> bool {
        self.audiences.iter().any(|a| a == audience)
    }
}

/// Require HTTPS, or plain HTTP to a loopback host
fn require_secure_url(raw: &str, what: &str) -> AuthResult<Url> {
    let url = Url::parse(raw).map_err(|e| config_error(format!("{what} is not a valid URL: {e}")))?;

    let loopback = match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    };

    match url.scheme() {
        "https" => Ok(url),
        "http" if loopback => Ok(url),
        scheme => Err(config_error(format!(
            "{what} must use https (got '{scheme}')"
        ))),
    }
}

fn config_error(message: impl Into<String>) -> AuthError {
    AuthError::Configuration(message.into())
}
