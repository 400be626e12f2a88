//! Authentication metrics
//!
//! Enable with the `metrics` feature flag. Requires a `metrics` recorder
//! to be installed (e.g., via `metrics-exporter-prometheus`).
//!
//! ## Metrics Provided
//!
//! - `obo_auth_authentications_total` - Counter for authentication attempts (labels: issuer, outcome)
//! - `obo_auth_exchanges_total` - Counter for token exchange calls (labels: outcome)
//! - `obo_auth_cache_lookups_total` - Counter for cache lookups (labels: result)
//!
//! Outcome labels are either `success` or an [`ErrorKind`](crate::ErrorKind)
//! code, so cardinality stays bounded.

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter};

/// Issuer label for authentications that never resolved an issuer
pub(crate) const UNMATCHED_ISSUER: &str = "unmatched";

#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static INIT: Once = Once::new();

/// Register metric descriptions. Idempotent.
#[cfg(feature = "metrics")]
pub fn init_auth_metrics() {
    INIT.call_once(|| {
        describe_counter!(
            "obo_auth_authentications_total",
            "Total bearer token authentications (success and failure)"
        );
        describe_counter!(
            "obo_auth_exchanges_total",
            "Total on-behalf-of token exchange calls"
        );
        describe_counter!(
            "obo_auth_cache_lookups_total",
            "Total derived credential cache lookups"
        );
    });
}

/// Record an authentication attempt
///
/// `issuer` is the configured issuer name, or [`UNMATCHED_ISSUER`] when no
/// issuer was resolved.
#[cfg(feature = "metrics")]
pub(crate) fn record_authentication(issuer: &str, outcome: &str) {
    counter!(
        "obo_auth_authentications_total",
        "issuer" => issuer.to_owned(),
        "outcome" => outcome.to_owned()
    )
    .increment(1);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_exchange(outcome: &str) {
    counter!("obo_auth_exchanges_total", "outcome" => outcome.to_owned()).increment(1);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("obo_auth_cache_lookups_total", "result" => result).increment(1);
}

// No-op versions when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
#[allow(missing_docs)]
pub fn init_auth_metrics() {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_authentication(_issuer: &str, _outcome: &str) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_exchange(_outcome: &str) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_cache_lookup(_hit: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_auth_metrics() {
        init_auth_metrics();
        init_auth_metrics();
    }

    #[test]
    fn test_record_functions_without_recorder() {
        init_auth_metrics();
        record_authentication("corp", "success");
        record_authentication(UNMATCHED_ISSUER, "issuer_unmatched");
        record_exchange("success");
        record_exchange("exchange_rejected");
        record_cache_lookup(true);
        record_cache_lookup(false);
    }
}
