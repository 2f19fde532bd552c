//! Retry executor.
//!
//! Wraps one logical call to one provider with bounded retries. Every
//! attempt first waits for the provider's permit and pacing token, then is
//! gated by its circuit breaker and reports its outcome back to it:
//!
//! 1. The breaker rejects: return `BreakerOpen` without calling
//! 2. Success: record success, return the payload
//! 3. Transient failure (timeout, 5xx, 429): record failure, sleep
//!    `attempt * base_delay`, try again up to `max_retries` times
//! 4. Permanent failure (other 4xx): record failure, return immediately
//!
//! The outcome is recorded before the permit is released, so the next
//! queued caller is gated on up-to-date state. Retries run in a bounded
//! loop, never recursion.

use log::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::{ResilienceError, RetryClass};
use crate::models::{Payload, ProviderRequest};
use crate::registry::{Admission, CircuitBreaker, CircuitState, ProviderHandle};

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute `request` against `provider`, retrying transient failures.
    ///
    /// Returns the payload, `BreakerOpen` if the breaker rejected an attempt,
    /// or the last error once retries are exhausted.
    pub async fn execute(
        &self,
        provider: &ProviderHandle,
        request: &ProviderRequest,
    ) -> Result<Payload, ResilienceError> {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let error = {
                let _permit = provider.acquire().await?;

                let Some(admission) = provider.breaker().admit() else {
                    debug!(
                        "Circuit open for '{}', rejecting attempt {} without a call",
                        provider.id(),
                        attempt
                    );
                    return Err(breaker_open(provider));
                };

                let mut guard = AttemptGuard::new(provider.breaker(), admission);
                match provider
                    .fetch_with_timeout(request, self.config.request_timeout())
                    .await
                {
                    Ok(payload) => {
                        guard.record(true);
                        if attempt > 1 {
                            debug!("'{}' succeeded on attempt {}", provider.id(), attempt);
                        }
                        return Ok(payload);
                    }
                    Err(e) => {
                        if e.is_provider_outcome() {
                            guard.record(false);
                        }
                        e
                    }
                }
            };

            match error.retry_class() {
                RetryClass::Retryable => {
                    if attempt >= max_attempts {
                        warn!(
                            "'{}' failed after {} attempts: {}",
                            provider.id(),
                            attempt,
                            error
                        );
                        return Err(error);
                    }

                    if provider.breaker().state() == CircuitState::Open {
                        debug!(
                            "'{}' attempt {} failed ({}) and the circuit is open, not retrying",
                            provider.id(),
                            attempt,
                            error
                        );
                        return Err(breaker_open(provider));
                    }

                    let delay = self.config.base_delay() * attempt;
                    debug!(
                        "'{}' attempt {}/{} failed ({}), retrying in {:?}",
                        provider.id(),
                        attempt,
                        max_attempts,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryClass::NonRetryable => {
                    debug!("'{}' failed permanently: {}", provider.id(), error);
                    return Err(error);
                }
                RetryClass::BreakerOpen => {
                    return Err(error);
                }
            }
        }
    }
}

fn breaker_open(provider: &ProviderHandle) -> ResilienceError {
    ResilienceError::BreakerOpen {
        provider: provider.id().to_string(),
    }
}

/// Ensures an admitted attempt always leaves the breaker consistent.
///
/// If the attempt future is dropped (batch cancelled, phase timeout) or
/// ends without a provider outcome, the breaker is told the attempt was
/// abandoned so a HalfOpen probe slot is not held forever.
struct AttemptGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    recorded: bool,
}

impl<'a> AttemptGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            admission,
            recorded: false,
        }
    }

    fn record(&mut self, success: bool) {
        self.breaker.record_admitted(self.admission, success);
        self.recorded = true;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.abandon(self.admission);
        }
    }
}
