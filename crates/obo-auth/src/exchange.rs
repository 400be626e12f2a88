//! OAuth 2.0 Token Exchange (RFC 8693)
//!
//! Trades a verified bearer token for a derivative token scoped to one
//! downstream audience. The derivative token is addressed to the downstream
//! system, not to this service, so its payload is read without signature
//! verification: only to learn its expiry, roles and the claims the
//! delegation adapters need.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::from_unix;
use crate::config::{ClientAuthMethod, ExchangeConfig, TrustedIssuer};
use crate::error::{AuthError, AuthResult};
use crate::jwt::{numeric_date, peek_claims};
use crate::auth_metrics;
use crate::retry::{RetryConfig, describe_transport_error};
use crate::types::DerivedCredential;

/// RFC 8693 grant type
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// RFC 8693 access token type identifier
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Successful token endpoint response
#[derive(Clone, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    #[serde(default)]
    issued_token_type: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenExchangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenExchangeResponse")
            .field("access_token", &"[REDACTED]")
            .field("issued_token_type", &self.issued_token_type)
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// RFC 6749 section 5.2 error body
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// Token exchange client
///
/// Stateless apart from its HTTP connection pool; never reads or writes
/// sessions.
#[derive(Clone)]
pub struct TokenExchangeClient {
    http_client: reqwest::Client,
    retry: RetryConfig,
}

impl std::fmt::Debug for TokenExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenExchangeClient")
            .field("retry", &self.retry)
            .field("http_client", &"<reqwest::Client>")
            .finish()
    }
}

impl TokenExchangeClient {
    /// Create a client with a per-request timeout and retry policy
    ///
    /// # Errors
    ///
    /// [`AuthError::Configuration`] when the HTTP client cannot be built.
    pub fn new(timeout: Duration, retry: RetryConfig) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http_client, retry })
    }

    /// Exchange `subject_token` for a credential addressed to `audience`
    ///
    /// Network failures, timeouts and 5xx responses are retried with
    /// backoff; 4xx responses are final.
    ///
    /// # Errors
    ///
    /// - [`AuthError::ExchangeNotConfigured`] when the issuer has no exchange settings
    /// - [`AuthError::ExchangeRejected`] on a 4xx response
    /// - [`AuthError::ExchangeUnavailable`] once retries are exhausted
    /// - [`AuthError::InvalidExchangeResponse`] when the response lacks a
    ///   usable token, expiry or required claim
    pub async fn exchange(
        &self,
        subject_token: &SecretString,
        audience: &str,
        issuer: &TrustedIssuer,
        now: SystemTime,
    ) -> AuthResult<DerivedCredential> {
        let config = issuer
            .exchange
            .as_ref()
            .ok_or_else(|| AuthError::ExchangeNotConfigured(issuer.name.clone()))?;

        let result = self
            .retry
            .run("token_exchange", |attempt| {
                self.send_once(subject_token, audience, config, attempt)
            })
            .await
            .and_then(|response| build_credential(response, audience, config, now));

        match &result {
            Ok(credential) => {
                info!(
                    issuer = %issuer.name,
                    audience,
                    roles = credential.roles.len(),
                    "Token exchange succeeded"
                );
                auth_metrics::record_exchange("success");
            }
            Err(e) => {
                warn!(issuer = %issuer.name, audience, error = %e, "Token exchange failed");
                auth_metrics::record_exchange(e.kind().as_str());
            }
        }
        result
    }

    async fn send_once(
        &self,
        subject_token: &SecretString,
        audience: &str,
        config: &ExchangeConfig,
        attempt: u32,
    ) -> AuthResult<TokenExchangeResponse> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", TOKEN_EXCHANGE_GRANT),
            ("subject_token", subject_token.expose_secret().as_str()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
            ("audience", audience),
        ];
        if let Some(scope) = &config.scope {
            form.push(("scope", scope.as_str()));
        }
        if let Some(token_type) = &config.requested_token_type {
            form.push(("requested_token_type", token_type.as_str()));
        }

        let mut request = self.http_client.post(&config.token_endpoint);
        match config.auth_method {
            ClientAuthMethod::ClientSecretBasic => {
                request = request.basic_auth(
                    &config.client_id,
                    Some(config.client_secret.expose_secret()),
                );
            }
            ClientAuthMethod::ClientSecretPost => {
                form.push(("client_id", config.client_id.as_str()));
                form.push(("client_secret", config.client_secret.expose_secret().as_str()));
            }
        }

        debug!(endpoint = %config.token_endpoint, audience, attempt, "Sending token exchange request");

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::ExchangeUnavailable(describe_transport_error(&e)))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<TokenExchangeResponse>().await.map_err(|_| {
                AuthError::InvalidExchangeResponse("response body is not a token response".to_string())
            });
        }

        if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            return Err(AuthError::ExchangeUnavailable(format!(
                "token endpoint returned status {}",
                status.as_u16()
            )));
        }

        let reason = response
            .json::<TokenErrorResponse>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
        Err(AuthError::ExchangeRejected {
            status: status.as_u16(),
            reason,
        })
    }
}

/// Turn a token response into a credential
///
/// Expiry is the earlier of `expires_in` and the derived token's own `exp`.
fn build_credential(
    response: TokenExchangeResponse,
    audience: &str,
    config: &ExchangeConfig,
    now: SystemTime,
) -> AuthResult<DerivedCredential> {
    if response.access_token.is_empty() {
        return Err(AuthError::InvalidExchangeResponse(
            "empty access_token".to_string(),
        ));
    }

    // Opaque tokens carry no readable claims
    let claims = peek_claims(&response.access_token).unwrap_or(Value::Null);

    let out_of_range =
        |field: &str| AuthError::InvalidExchangeResponse(format!("{field} is out of range"));
    let from_expires_in = response
        .expires_in
        .map(|secs| {
            now.checked_add(Duration::from_secs(secs))
                .ok_or_else(|| out_of_range("expires_in"))
        })
        .transpose()?;
    let from_exp = numeric_date(&claims, "exp")
        .ok()
        .flatten()
        .map(|secs| from_unix(secs).ok_or_else(|| out_of_range("exp")))
        .transpose()?;

    let expires_at = match (from_expires_in, from_exp) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => {
            return Err(AuthError::InvalidExchangeResponse(
                "response carries no expiry".to_string(),
            ));
        }
    };
    if expires_at <= now {
        return Err(AuthError::InvalidExchangeResponse(
            "derived token is already expired".to_string(),
        ));
    }

    let mut passthrough = BTreeMap::new();
    if let Some(required) = &config.required_claim {
        match required.resolve(&claims) {
            Some(value) if !value.is_null() => {
                passthrough.insert(required.as_str().to_string(), value.clone());
            }
            _ => {
                return Err(AuthError::InvalidExchangeResponse(format!(
                    "derived token lacks required claim '{required}'"
                )));
            }
        }
    }
    for path in &config.passthrough_claims {
        if let Some(value) = path.resolve(&claims) {
            passthrough.insert(path.as_str().to_string(), value.clone());
        }
    }

    let token_type = response
        .issued_token_type
        .or(response.token_type)
        .unwrap_or_else(|| ACCESS_TOKEN_TYPE.to_string());

    Ok(DerivedCredential {
        roles: config.roles_claim.resolve_strings(&claims, false),
        token: SecretString::new(response.access_token),
        audience: audience.to_string(),
        token_type,
        expires_at,
        claims: passthrough,
    })
}
