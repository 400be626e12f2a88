//! JWT verification infrastructure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             TokenVerifier                │
//! │  - size / header / algorithm gates       │
//! │  - (iss, aud) -> TrustedIssuer lookup    │
//! │  - signature + exp/nbf/iat + aud/iss     │
//! └──────────────────┬───────────────────────┘
//!                    │ one per issuer
//!          ┌─────────┴─────────┐
//!          │    JwksClient     │
//!          │  TTL cache, kid   │
//!          │  miss refresh,    │
//!          │  single flight    │
//!          └───────────────────┘
//! ```
//!
//! Header and payload segments are inspected before the signature is checked
//! in exactly two places: to select the algorithm gate and to select the
//! issuer configuration. Nothing read from an unverified segment is returned
//! to a caller.

pub mod jwks;
pub mod validator;

pub use jwks::JwksClient;
pub use validator::TokenVerifier;

use std::str::FromStr;
use std::time::SystemTime;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::is_asymmetric;
use crate::error::{AuthError, AuthResult};

/// Outcome of a successful verification
///
/// Every field comes from a token whose signature, validity window,
/// issuer and audience were checked.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// Name of the matched issuer configuration
    pub issuer_name: String,
    /// `sub` claim
    pub subject: String,
    /// `aud` values
    pub audiences: Vec<String>,
    /// `exp` claim
    pub expires_at: SystemTime,
    /// `iat` claim
    pub issued_at: SystemTime,
    /// Header `alg`
    pub algorithm: Algorithm,
    /// Header `kid`
    pub key_id: String,
    /// Full claim set
    pub claims: Value,
}

/// JOSE header fields consulted before verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JoseHeader {
    pub algorithm: Algorithm,
    pub key_id: Option<String>,
}

#[derive(Deserialize)]
struct RawHeader {
    alg: Option<String>,
    kid: Option<String>,
}

/// Split a compact JWS into its three segments
pub(crate) fn split_compact(token: &str) -> AuthResult<[&str; 3]> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => Ok([h, p, s]),
        _ => Err(AuthError::MalformedToken(
            "expected three dot-separated segments".to_string(),
        )),
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str, what: &str) -> AuthResult<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::MalformedToken(format!("{what} is not base64url")))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::MalformedToken(format!("{what} is not valid JSON")))
}

/// Read and gate the header `alg`
///
/// `none`, HMAC and unknown algorithm names are rejected here, before any
/// issuer is consulted.
pub(crate) fn parse_header(token: &str) -> AuthResult<JoseHeader> {
    let [header, _, _] = split_compact(token)?;
    let raw: RawHeader = decode_segment(header, "header")?;

    let alg = raw
        .alg
        .ok_or_else(|| AuthError::MalformedToken("header has no alg".to_string()))?;

    let algorithm = Algorithm::from_str(&alg)
        .map_err(|_| AuthError::UnsupportedAlgorithm(alg.clone()))?;
    if !is_asymmetric(algorithm) {
        return Err(AuthError::UnsupportedAlgorithm(alg));
    }

    Ok(JoseHeader {
        algorithm,
        key_id: raw.kid,
    })
}

/// Decode the payload without verifying it
///
/// Used for issuer selection on inbound tokens and for reading claims of
/// derived tokens addressed to downstream systems.
pub(crate) fn peek_claims(token: &str) -> AuthResult<Value> {
    let [_, payload, _] = split_compact(token)?;
    let claims: Value = decode_segment(payload, "payload")?;
    if !claims.is_object() {
        return Err(AuthError::MalformedToken(
            "payload is not a JSON object".to_string(),
        ));
    }
    Ok(claims)
}

/// `aud` as a list, accepting both the string and array forms
pub(crate) fn audiences(claims: &Value) -> Vec<String> {
    match claims.get("aud") {
        Some(Value::String(aud)) => vec![aud.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Read a NumericDate claim; fractional values are truncated
pub(crate) fn numeric_date(claims: &Value, name: &str) -> AuthResult<Option<u64>> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| AuthError::MalformedToken(format!("{name} is not a valid NumericDate"))),
        Some(_) => Err(AuthError::MalformedToken(format!(
            "{name} is not a valid NumericDate"
        ))),
    }
}
