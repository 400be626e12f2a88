use serde_json::Value;
use tracing::debug;

use crate::config::TrustedIssuer;
use crate::types::Principal;

/// Build a [`Principal`] from a verified claim set
///
/// Never fails. External roles are translated through the issuer's role
/// table; roles without a mapping are dropped, and a token with no surviving
/// role receives [`UNASSIGNED_ROLE`](crate::UNASSIGNED_ROLE). Scopes and
/// passthrough claims are copied verbatim.
pub fn map_principal(issuer: &TrustedIssuer, claims: &Value) -> Principal {
    let mappings = &issuer.claim_mappings;

    let subject = mappings
        .subject
        .resolve(claims)
        .and_then(Value::as_str)
        .or_else(|| claims.get("sub").and_then(Value::as_str))
        .unwrap_or_default();

    let external_roles = mappings.roles.resolve_strings(claims, false);
    let mut roles = Vec::new();
    for role in &external_roles {
        match issuer.role_mappings.get(role) {
            Some(internal) => roles.extend(internal.iter().cloned()),
            None => debug!(issuer = %issuer.name, role = %role, "Dropping unmapped role"),
        }
    }

    let scopes = mappings.scopes.resolve_strings(claims, true);

    let mut principal = Principal::new(subject, &issuer.name)
        .with_roles(roles)
        .with_scopes(scopes);

    for path in &mappings.passthrough {
        if let Some(value) = path.resolve(claims) {
            principal = principal.with_claim(path.as_str(), value.clone());
        }
    }

    principal
}
