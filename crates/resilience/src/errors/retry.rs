/// Classification for retry policy.
///
/// Used by the retry executor to decide what to do after a failed attempt.
///
/// # Behavior Summary
///
/// | Class | Retry same provider? | Record breaker failure? |
/// |-------|----------------------|-------------------------|
/// | `Retryable` | Yes, after backoff | Yes |
/// | `NonRetryable` | No | Yes, for provider outcomes |
/// | `BreakerOpen` | No | No (no attempt was made) |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Timeout, 5xx or 429. The provider may recover within a few seconds.
    Retryable,

    /// The request is fundamentally invalid for this provider, or the failure
    /// is local. Retrying won't help.
    NonRetryable,

    /// The breaker rejected the call; the resolver should move to the next provider.
    BreakerOpen,
}
