//! Error types for token verification, sessions and token exchange
//!
//! Every failure carries a stable [`ErrorKind`] so callers and audit sinks can
//! branch on *which* check failed without parsing messages. Messages describe
//! the failed check only; they never include token content or key material.

use serde::Serialize;
use thiserror::Error;

/// Result type for authentication and exchange operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication, session and exchange errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token exceeds maximum size: {actual} bytes > {limit} bytes")]
    TokenTooLarge { actual: usize, limit: usize },

    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("No unique trusted issuer for token: {0}")]
    IssuerUnmatched(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token not yet valid: {0}")]
    TokenNotYetValid(String),

    #[error("Audience mismatch: {0}")]
    AudienceMismatch(String),

    #[error("Signing key fetch failed: {0}")]
    KeyFetchFailed(String),

    #[error("Token exchange rejected by issuer (HTTP {status}): {reason}")]
    ExchangeRejected { status: u16, reason: String },

    #[error("Token exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("Invalid token exchange response: {0}")]
    InvalidExchangeResponse(String),

    #[error("Token exchange not configured for issuer '{0}'")]
    ExchangeNotConfigured(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Cached credential failed integrity check")]
    CacheIntegrityMismatch,

    #[error("Credential not cacheable: {0}")]
    CacheRejected(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Stable, serializable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedToken,
    TokenTooLarge,
    UnsupportedAlgorithm,
    SignatureInvalid,
    IssuerUnmatched,
    TokenExpired,
    TokenNotYetValid,
    AudienceMismatch,
    KeyFetchFailed,
    ExchangeRejected,
    ExchangeUnavailable,
    InvalidExchangeResponse,
    ExchangeNotConfigured,
    SessionNotFound,
    CacheIntegrityMismatch,
    CacheRejected,
    Crypto,
    Configuration,
}

impl ErrorKind {
    /// Snake-case code used in audit details and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedToken => "malformed_token",
            ErrorKind::TokenTooLarge => "token_too_large",
            ErrorKind::UnsupportedAlgorithm => "unsupported_algorithm",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::IssuerUnmatched => "issuer_unmatched",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::TokenNotYetValid => "token_not_yet_valid",
            ErrorKind::AudienceMismatch => "audience_mismatch",
            ErrorKind::KeyFetchFailed => "key_fetch_failed",
            ErrorKind::ExchangeRejected => "exchange_rejected",
            ErrorKind::ExchangeUnavailable => "exchange_unavailable",
            ErrorKind::InvalidExchangeResponse => "invalid_exchange_response",
            ErrorKind::ExchangeNotConfigured => "exchange_not_configured",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::CacheIntegrityMismatch => "cache_integrity_mismatch",
            ErrorKind::CacheRejected => "cache_rejected",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AuthError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::MalformedToken(_) => ErrorKind::MalformedToken,
            AuthError::TokenTooLarge { .. } => ErrorKind::TokenTooLarge,
            AuthError::UnsupportedAlgorithm(_) => ErrorKind::UnsupportedAlgorithm,
            AuthError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            AuthError::IssuerUnmatched(_) => ErrorKind::IssuerUnmatched,
            AuthError::TokenExpired => ErrorKind::TokenExpired,
            AuthError::TokenNotYetValid(_) => ErrorKind::TokenNotYetValid,
            AuthError::AudienceMismatch(_) => ErrorKind::AudienceMismatch,
            AuthError::KeyFetchFailed(_) => ErrorKind::KeyFetchFailed,
            AuthError::ExchangeRejected { .. } => ErrorKind::ExchangeRejected,
            AuthError::ExchangeUnavailable(_) => ErrorKind::ExchangeUnavailable,
            AuthError::InvalidExchangeResponse(_) => ErrorKind::InvalidExchangeResponse,
            AuthError::ExchangeNotConfigured(_) => ErrorKind::ExchangeNotConfigured,
            AuthError::SessionNotFound => ErrorKind::SessionNotFound,
            AuthError::CacheIntegrityMismatch => ErrorKind::CacheIntegrityMismatch,
            AuthError::CacheRejected(_) => ErrorKind::CacheRejected,
            AuthError::Crypto(_) => ErrorKind::Crypto,
            AuthError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether a later attempt at the same operation may succeed
    ///
    /// Only transport-level failures qualify. Everything raised by a
    /// verification check or by an issuer policy decision is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::KeyFetchFailed(_) | AuthError::ExchangeUnavailable(_)
        )
    }

    /// Whether this error came out of bearer token verification
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            AuthError::MalformedToken(_)
                | AuthError::TokenTooLarge { .. }
                | AuthError::UnsupportedAlgorithm(_)
                | AuthError::SignatureInvalid(_)
                | AuthError::IssuerUnmatched(_)
                | AuthError::TokenExpired
                | AuthError::TokenNotYetValid(_)
                | AuthError::AudienceMismatch(_)
                | AuthError::KeyFetchFailed(_)
        )
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            AuthError::MalformedToken(_)
            | AuthError::TokenTooLarge { .. }
            | AuthError::UnsupportedAlgorithm(_)
            | AuthError::SignatureInvalid(_)
            | AuthError::IssuerUnmatched(_)
            | AuthError::TokenExpired
            | AuthError::TokenNotYetValid(_)
            | AuthError::AudienceMismatch(_) => "verification",
            AuthError::KeyFetchFailed(_) => "key_fetch",
            AuthError::ExchangeRejected { .. }
            | AuthError::ExchangeUnavailable(_)
            | AuthError::InvalidExchangeResponse(_)
            | AuthError::ExchangeNotConfigured(_) => "exchange",
            AuthError::SessionNotFound => "session",
            AuthError::CacheIntegrityMismatch | AuthError::CacheRejected(_) => "cache",
            AuthError::Crypto(_) => "crypto",
            AuthError::Configuration(_) => "configuration",
        }
    }
}
