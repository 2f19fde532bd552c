//! Provider registry module.
//!
//! This module provides the per-provider state every call goes through:
//! - Provider registration and lookup
//! - Sliding-window circuit breaking, optionally persisted across runs
//! - Token-bucket pacing for providers with published quotas
//! - Attempt diagnostics for fallback chains

mod breaker_store;
mod circuit_breaker;
mod diagnostics;
mod provider_registry;
mod rate_limiter;

pub use breaker_store::BreakerStore;
pub(crate) use breaker_store::sanitize;
pub use circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use diagnostics::{AttemptOutcome, FetchDiagnostics, ProviderAttempt};
pub use provider_registry::{ProviderHandle, ProviderRegistry};
pub use rate_limiter::RateLimiter;
