//! Error types and retry classification for the resilience layer.
//!
//! This module provides:
//! - [`ResilienceError`]: The main error enum for all provider, cache and ledger operations
//! - [`RetryClass`]: Classification that drives the retry executor
//! - [`ProviderFailure`]: The last error seen from one provider in an exhausted chain

mod retry;

pub use retry::RetryClass;

use std::fmt;

use thiserror::Error;

/// Errors that can occur while talking to providers or touching local state.
///
/// Each variant is classified into a [`RetryClass`] via the [`retry_class`](Self::retry_class)
/// method, which determines how the retry executor handles it.
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    /// Timeout, HTTP 5xx or HTTP 429.
    /// Retried with linear backoff and counted against the provider's breaker.
    #[error("Transient provider error: {provider} - {reason}")]
    Transient {
        /// The provider that failed
        provider: String,
        /// What went wrong (status line, timeout, transport error)
        reason: String,
    },

    /// Any other 4xx, or a response the parser rejected.
    /// Counted against the breaker but never retried.
    #[error("Permanent provider error: {provider} (status {status:?}) - {message}")]
    Permanent {
        /// The provider that failed
        provider: String,
        /// HTTP status, when the failure came from a response
        status: Option<u16>,
        /// Error message from the provider or parser
        message: String,
    },

    /// The provider's circuit breaker rejected the call before any attempt.
    #[error("Circuit open: {provider}")]
    BreakerOpen {
        /// The provider with an open circuit
        provider: String,
    },

    /// Every provider in a capability's chain failed.
    #[error("All providers exhausted for '{capability}': {}", FailureList(.attempts))]
    AllProvidersExhausted {
        /// The logical capability that could not be served
        capability: String,
        /// The last error from each provider tried, in chain order
        attempts: Vec<ProviderFailure>,
    },

    /// No chain is registered for the requested capability.
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// A chain references a provider that was never registered.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Cache read or write failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Filesystem or (de)serialization failure while persisting state.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A dispatched item did not finish before the batch was abandoned.
    #[error("Cancelled")]
    Cancelled,

    /// A dispatched item panicked or its task was aborted.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl ResilienceError {
    /// Returns the retry classification for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use quantflow_resilience::errors::{ResilienceError, RetryClass};
    ///
    /// let error = ResilienceError::Transient {
    ///     provider: "POLYGON".to_string(),
    ///     reason: "HTTP 503".to_string(),
    /// };
    /// assert_eq!(error.retry_class(), RetryClass::Retryable);
    ///
    /// let error = ResilienceError::BreakerOpen { provider: "POLYGON".to_string() };
    /// assert_eq!(error.retry_class(), RetryClass::BreakerOpen);
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Transient { .. } => RetryClass::Retryable,
            Self::BreakerOpen { .. } => RetryClass::BreakerOpen,
            Self::Permanent { .. }
            | Self::AllProvidersExhausted { .. }
            | Self::UnknownCapability(_)
            | Self::UnknownProvider(_)
            | Self::Cache(_)
            | Self::Storage(_)
            | Self::Config(_)
            | Self::Cancelled
            | Self::TaskFailed(_) => RetryClass::NonRetryable,
        }
    }

    /// Whether this error came back from (or on behalf of) a provider call.
    ///
    /// Only provider outcomes are recorded in a circuit breaker.
    pub fn is_provider_outcome(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Permanent { .. })
    }

    /// Build a transient error for a timed-out attempt.
    pub fn timeout(provider: &str) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            reason: "request timed out".to_string(),
        }
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ResilienceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {e}"))
    }
}

/// The last error seen from one provider while resolving a capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

struct FailureList<'a>(&'a [ProviderFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no providers tried");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        let error = ResilienceError::Transient {
            provider: "POLYGON".to_string(),
            reason: "HTTP 429".to_string(),
        };
        assert_eq!(error.retry_class(), RetryClass::Retryable);
        assert!(error.is_provider_outcome());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let error = ResilienceError::timeout("FRED");
        assert_eq!(error.retry_class(), RetryClass::Retryable);
    }

    #[test]
    fn test_permanent_is_not_retryable() {
        let error = ResilienceError::Permanent {
            provider: "FRED".to_string(),
            status: Some(404),
            message: "series not found".to_string(),
        };
        assert_eq!(error.retry_class(), RetryClass::NonRetryable);
        assert!(error.is_provider_outcome());
    }

    #[test]
    fn test_breaker_open_classification() {
        let error = ResilienceError::BreakerOpen {
            provider: "POLYGON".to_string(),
        };
        assert_eq!(error.retry_class(), RetryClass::BreakerOpen);
        assert!(!error.is_provider_outcome());
    }

    #[test]
    fn test_local_errors_never_retry() {
        assert_eq!(
            ResilienceError::Cache("disk full".to_string()).retry_class(),
            RetryClass::NonRetryable
        );
        assert_eq!(ResilienceError::Cancelled.retry_class(), RetryClass::NonRetryable);
    }

    #[test]
    fn test_exhausted_display_names_each_provider() {
        let error = ResilienceError::AllProvidersExhausted {
            capability: "VIX".to_string(),
            attempts: vec![
                ProviderFailure {
                    provider: "POLYGON".to_string(),
                    error: "Circuit open: POLYGON".to_string(),
                },
                ProviderFailure {
                    provider: "FRED".to_string(),
                    error: "HTTP 503".to_string(),
                },
            ],
        };
        assert_eq!(
            format!("{}", error),
            "All providers exhausted for 'VIX': POLYGON: Circuit open: POLYGON; FRED: HTTP 503"
        );
    }

    #[test]
    fn test_error_display() {
        let error = ResilienceError::Transient {
            provider: "TRADIER".to_string(),
            reason: "HTTP 502".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Transient provider error: TRADIER - HTTP 502"
        );

        let error = ResilienceError::BreakerOpen {
            provider: "TRADIER".to_string(),
        };
        assert_eq!(format!("{}", error), "Circuit open: TRADIER");
    }
}
