//! Multi-issuer bearer token verification
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. size limit
//! 2. header `alg`: asymmetric only, `none` and HMAC always rejected
//! 3. `(iss, aud)` from the unverified payload selects exactly one issuer
//! 4. `alg` is in that issuer's allow-list
//! 5. signature against the issuer's JWKS key named by `kid`
//! 6. `exp`, `nbf` and `iat` with clock skew
//! 7. audience membership and exact issuer match on the verified claims

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Validation, decode};
use serde_json::Value;
use tracing::{debug, warn};

use super::{JwksClient, VerifiedToken, audiences, numeric_date, parse_header, peek_claims};
use crate::clock::from_unix;
use crate::config::{TrustedIssuer, VerifierConfig};
use crate::error::{AuthError, AuthResult};

#[derive(Debug)]
struct IssuerEntry {
    config: Arc<TrustedIssuer>,
    keys: JwksClient,
}

/// Verifies bearer tokens against the configured trusted issuers
///
/// Owns one [`JwksClient`] per issuer. Holds no session state.
#[derive(Debug)]
pub struct TokenVerifier {
    entries: Vec<IssuerEntry>,
    /// `(iss, aud)` -> index into `entries`
    by_issuer_audience: HashMap<(String, String), usize>,
    clock_skew: Duration,
    max_token_bytes: usize,
}

impl TokenVerifier {
    /// Build the verifier and its issuer lookup table
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] when two issuers claim the same
    /// `(iss, aud)` pair or the HTTP client cannot be built.
    pub fn new(issuers: &[TrustedIssuer], config: &VerifierConfig) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| AuthError::Configuration(format!("failed to build HTTP client: {e}")))?;

        let mut entries = Vec::with_capacity(issuers.len());
        let mut by_issuer_audience = HashMap::new();

        for (index, issuer) in issuers.iter().enumerate() {
            for audience in &issuer.audiences {
                let key = (issuer.issuer.clone(), audience.clone());
                if by_issuer_audience.insert(key, index).is_some() {
                    return Err(AuthError::Configuration(format!(
                        "issuer '{}' with audience '{}' is configured more than once",
                        issuer.issuer, audience
                    )));
                }
            }
            entries.push(IssuerEntry {
                config: Arc::new(issuer.clone()),
                keys: JwksClient::new(issuer.jwks_uri.clone(), http_client.clone(), config),
            });
        }

        Ok(Self {
            entries,
            by_issuer_audience,
            clock_skew: config.clock_skew(),
            max_token_bytes: config.max_token_bytes,
        })
    }

    /// Issuer configuration by name
    pub fn issuer(&self, name: &str) -> Option<&Arc<TrustedIssuer>> {
        self.entries
            .iter()
            .map(|e| &e.config)
            .find(|c| c.name == name)
    }

    /// Verify `token` as of `now`
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] naming the first check that failed.
    pub async fn verify(&self, token: &str, now: SystemTime) -> AuthResult<VerifiedToken> {
        if token.len() > self.max_token_bytes {
            return Err(AuthError::TokenTooLarge {
                actual: token.len(),
                limit: self.max_token_bytes,
            });
        }

        let header = parse_header(token)?;
        let unverified = peek_claims(token)?;
        let entry = self.match_issuer(&unverified)?;
        let issuer = &entry.config;

        if !issuer.allowed_algorithms.contains(&header.algorithm) {
            warn!(
                issuer = %issuer.name,
                algorithm = ?header.algorithm,
                allowed = ?issuer.allowed_algorithms,
                "JWT algorithm not allowed for issuer"
            );
            return Err(AuthError::UnsupportedAlgorithm(format!(
                "{:?}",
                header.algorithm
            )));
        }

        let key_id = header
            .key_id
            .ok_or_else(|| AuthError::MalformedToken("header has no kid".to_string()))?;

        let decoding_key = entry.keys.decoding_key(&key_id).await?;

        // Time, audience and issuer are checked below against the injected clock
        let mut validation = Validation::new(header.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = decode::<Value>(token, &decoding_key, &validation)
            .map_err(|e| {
                warn!(issuer = %issuer.name, error = %e, "JWT signature verification failed");
                match e.kind() {
                    JwtErrorKind::InvalidAlgorithm => {
                        AuthError::UnsupportedAlgorithm(format!("{:?}", header.algorithm))
                    }
                    JwtErrorKind::Base64(_) | JwtErrorKind::Json(_) | JwtErrorKind::Utf8(_) => {
                        AuthError::MalformedToken("token segments do not decode".to_string())
                    }
                    _ => AuthError::SignatureInvalid("signature does not verify".to_string()),
                }
            })?
            .claims;

        let (expires_at, issued_at) = self.check_times(&claims, now)?;

        let token_audiences = audiences(&claims);
        if !token_audiences.iter().any(|a| issuer.accepts_audience(a)) {
            return Err(AuthError::AudienceMismatch(format!(
                "token is not addressed to issuer '{}' audiences",
                issuer.name
            )));
        }
        if claims.get("iss").and_then(Value::as_str) != Some(issuer.issuer.as_str()) {
            return Err(AuthError::IssuerUnmatched(
                "verified iss differs from matched issuer".to_string(),
            ));
        }

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::MalformedToken("token has no sub".to_string()))?
            .to_string();

        debug!(
            issuer = %issuer.name,
            subject = %subject,
            algorithm = ?header.algorithm,
            "JWT validation successful"
        );

        Ok(VerifiedToken {
            issuer_name: issuer.name.clone(),
            subject,
            audiences: token_audiences,
            expires_at,
            issued_at,
            algorithm: header.algorithm,
            key_id,
            claims,
        })
    }

    /// Select the single issuer configuration for the token's `(iss, aud)`
    fn match_issuer(&self, unverified: &Value) -> AuthResult<&IssuerEntry> {
        let iss = unverified
            .get("iss")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::MalformedToken("token has no iss".to_string()))?;
        let token_audiences = audiences(unverified);
        if token_audiences.is_empty() {
            return Err(AuthError::MalformedToken("token has no aud".to_string()));
        }

        let mut matched: Option<usize> = None;
        for audience in &token_audiences {
            if let Some(&index) = self
                .by_issuer_audience
                .get(&(iss.to_string(), audience.clone()))
            {
                match matched {
                    Some(existing) if existing != index => {
                        warn!(issuer = %iss, "Token matches more than one trusted issuer");
                        return Err(AuthError::IssuerUnmatched(
                            "token matches more than one trusted issuer".to_string(),
                        ));
                    }
                    _ => matched = Some(index),
                }
            }
        }

        matched.map(|index| &self.entries[index]).ok_or_else(|| {
            debug!(issuer = %iss, "No trusted issuer for token");
            AuthError::IssuerUnmatched("no trusted issuer for token iss/aud".to_string())
        })
    }

    fn check_times(&self, claims: &Value, now: SystemTime) -> AuthResult<(SystemTime, SystemTime)> {
        let skew = self.clock_skew;
        let latest_accepted = now
            .checked_add(skew)
            .ok_or_else(|| AuthError::MalformedToken("clock is out of range".to_string()))?;

        let exp = numeric_date(claims, "exp")?
            .ok_or_else(|| AuthError::MalformedToken("token has no exp".to_string()))
            .and_then(|secs| time_claim("exp", secs))?;
        // An exp too far out to represent with skew added is not expired
        if exp.checked_add(skew).is_some_and(|limit| now > limit) {
            return Err(AuthError::TokenExpired);
        }

        if let Some(secs) = numeric_date(claims, "nbf")?
            && time_claim("nbf", secs)? > latest_accepted
        {
            return Err(AuthError::TokenNotYetValid("nbf is in the future".to_string()));
        }

        let iat = numeric_date(claims, "iat")?
            .ok_or_else(|| AuthError::MalformedToken("token has no iat".to_string()))
            .and_then(|secs| time_claim("iat", secs))?;
        if iat > latest_accepted {
            return Err(AuthError::TokenNotYetValid("iat is in the future".to_string()));
        }

        Ok((exp, iat))
    }
}

fn time_claim(name: &str, secs: u64) -> AuthResult<SystemTime> {
    from_unix(secs)
        .ok_or_else(|| AuthError::MalformedToken(format!("{name} is out of range")))
}
