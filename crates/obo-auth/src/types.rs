//! Core identity and credential types
//!
//! [`Principal`] is what a verified bearer token becomes after claim mapping.
//! [`DerivedCredential`] is what a delegation adapter receives from
//! [`exchange`](crate::AuthenticationOrchestrator::exchange).

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;

/// Role assigned when none of a token's roles map to an internal role
pub const UNASSIGNED_ROLE: &str = "unassigned";

/// Verified caller identity with internal roles
///
/// Constructed only from a verified token (see
/// [`map_principal`](crate::claims::map_principal)); immutable afterwards.
/// The role set is never empty: an unmappable token carries
/// [`UNASSIGNED_ROLE`] so authorization decisions stay with the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    subject: String,
    issuer: String,
    roles: BTreeSet<String>,
    scopes: BTreeSet<String>,
    claims: BTreeMap<String, Value>,
}

impl Principal {
    /// Create a principal for `subject` as asserted by the named issuer
    ///
    /// The role set starts as `{unassigned}`; [`with_roles`](Self::with_roles)
    /// replaces it.
    pub fn new(subject: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            issuer: issuer.into(),
            roles: BTreeSet::from([UNASSIGNED_ROLE.to_string()]),
            scopes: BTreeSet::new(),
            claims: BTreeMap::new(),
        }
    }

    /// Replace the role set; an empty set becomes `{unassigned}`
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roles: BTreeSet<String> = roles.into_iter().map(Into::into).collect();
        self.roles = if roles.is_empty() {
            BTreeSet::from([UNASSIGNED_ROLE.to_string()])
        } else {
            roles
        };
        self
    }

    /// Replace the scope set
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Add a passthrough claim
    pub fn with_claim(mut self, name: impl Into<String>, value: Value) -> Self {
        self.claims.insert(name.into(), value);
        self
    }

    /// Subject identifier
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Name of the trusted issuer configuration that matched the token
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Internal roles
    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    /// Granted scopes
    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    /// Passthrough claims, keyed by the configured claim path
    pub fn claims(&self) -> &BTreeMap<String, Value> {
        &self.claims
    }

    /// Look up a passthrough claim
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// Check whether the principal holds an internal role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Check whether a scope was granted
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// True when no token role mapped to an internal role
    pub fn is_unassigned(&self) -> bool {
        self.roles.len() == 1 && self.roles.contains(UNASSIGNED_ROLE)
    }
}

/// Resource-scoped credential obtained through token exchange
///
/// Adapters treat the token as opaque. `roles` and `claims` come from the
/// derivative token (for example a legacy account name) when the issuer
/// returns a JWT.
#[derive(Debug, Clone)]
pub struct DerivedCredential {
    /// Derivative token (redacted in `Debug`)
    pub token: SecretString,
    /// Audience the token was exchanged for
    pub audience: String,
    /// Issued token type reported by the issuer
    pub token_type: String,
    /// Expiry of the derivative token
    pub expires_at: SystemTime,
    /// Roles carried by the derivative token
    pub roles: Vec<String>,
    /// Passthrough claims from the derivative token
    pub claims: BTreeMap<String, Value>,
}

impl DerivedCredential {
    /// Remaining lifetime at `now`, or `None` when already expired
    pub fn remaining_lifetime(&self, now: SystemTime) -> Option<std::time::Duration> {
        self.expires_at
            .duration_since(now)
            .ok()
            .filter(|d| !d.is_zero())
    }

    /// Look up a passthrough claim as a string
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}
