//! Attempt tracking for fallback-chain diagnostics.

use crate::errors::ProviderFailure;
use crate::models::ProviderId;

/// What happened when the resolver reached a provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Served from the file cache, no network call.
    CacheHit,
    /// Live call succeeded.
    Success,
    /// The breaker rejected the call before any attempt.
    BreakerOpen,
    /// The call failed after the executor gave up.
    Failed(String),
}

/// Record of a single provider attempt during a resolve.
#[derive(Clone, Debug)]
pub struct ProviderAttempt {
    pub provider_id: ProviderId,
    pub outcome: AttemptOutcome,
}

/// Detailed result of a resolve, one entry per provider reached.
#[derive(Clone, Debug, Default)]
pub struct FetchDiagnostics {
    pub attempts: Vec<ProviderAttempt>,
    /// Set when the capability's default value was returned.
    pub used_default: bool,
}

impl FetchDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, provider_id: ProviderId, outcome: AttemptOutcome) {
        self.attempts.push(ProviderAttempt {
            provider_id,
            outcome,
        });
    }

    /// Summary for logging/debugging.
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .attempts
            .iter()
            .map(|a| match &a.outcome {
                AttemptOutcome::CacheHit => format!("{}: CACHE", a.provider_id),
                AttemptOutcome::Success => format!("{}: SUCCESS", a.provider_id),
                AttemptOutcome::BreakerOpen => format!("{}: SKIPPED (circuit open)", a.provider_id),
                AttemptOutcome::Failed(err) => format!("{}: ERROR ({})", a.provider_id, err),
            })
            .collect();
        if self.used_default {
            parts.push("DEFAULT".to_string());
        }
        parts.join(" -> ")
    }

    /// Check if any provider succeeded (live or cached).
    pub fn has_success(&self) -> bool {
        self.attempts
            .iter()
            .any(|a| matches!(a.outcome, AttemptOutcome::Success | AttemptOutcome::CacheHit))
    }

    /// The last failure from each provider, in chain order.
    pub fn failures(&self) -> Vec<ProviderFailure> {
        self.attempts
            .iter()
            .filter_map(|a| match &a.outcome {
                AttemptOutcome::BreakerOpen => Some(ProviderFailure {
                    provider: a.provider_id.to_string(),
                    error: format!("Circuit open: {}", a.provider_id),
                }),
                AttemptOutcome::Failed(err) => Some(ProviderFailure {
                    provider: a.provider_id.to_string(),
                    error: err.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    #[test]
    fn test_diagnostics_summary() {
        let mut diag = FetchDiagnostics::new();
        diag.record(Cow::Borrowed("POLYGON"), AttemptOutcome::BreakerOpen);
        diag.record(
            Cow::Borrowed("CBOE"),
            AttemptOutcome::Failed("Timeout".to_string()),
        );
        diag.record(Cow::Borrowed("FRED"), AttemptOutcome::Success);

        assert_eq!(
            diag.summary(),
            "POLYGON: SKIPPED (circuit open) -> CBOE: ERROR (Timeout) -> FRED: SUCCESS"
        );
        assert!(diag.has_success());
    }

    #[test]
    fn test_failures_in_chain_order() {
        let mut diag = FetchDiagnostics::new();
        diag.record(Cow::Borrowed("A"), AttemptOutcome::BreakerOpen);
        diag.record(Cow::Borrowed("B"), AttemptOutcome::Failed("HTTP 503".to_string()));
        diag.used_default = true;

        let failures = diag.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].provider, "A");
        assert_eq!(failures[1].error, "HTTP 503");
        assert!(!diag.has_success());
        assert!(diag.summary().ends_with("DEFAULT"));
    }
}
