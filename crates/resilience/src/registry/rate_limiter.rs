//! Token bucket pacing for a single provider.
//!
//! Providers that publish a request quota get a bucket with a refill rate
//! of `requests_per_minute / 60` tokens per second. Attempts wait for a
//! token instead of failing, so pacing never counts against the breaker.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::models::ProviderId;

/// Token bucket state.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of available tokens.
    tokens: f64,
    /// Last time the bucket was updated.
    last_update: Instant,
    /// Token refill rate (tokens per second).
    rate: f64,
    /// Maximum bucket capacity.
    capacity: f64,
}

impl TokenBucket {
    fn new(requests_per_minute: u32, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate: requests_per_minute as f64 / 60.0,
            capacity,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

/// Rate limiter for one provider.
pub struct RateLimiter {
    provider: ProviderId,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// `burst` is the bucket capacity; it is floored at one token.
    pub fn new(provider: ProviderId, requests_per_minute: u32, burst: usize) -> Self {
        let requests_per_minute = requests_per_minute.max(1);
        Self {
            provider,
            bucket: Mutex::new(TokenBucket::new(requests_per_minute, burst.max(1) as f64)),
        }
    }

    fn lock_bucket(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            warn!(
                "Rate limiter mutex for '{}' was poisoned, recovering",
                self.provider
            );
            poisoned.into_inner()
        })
    }

    /// Wait (asynchronously) until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait_time = {
                let mut bucket = self.lock_bucket();
                if bucket.try_acquire() {
                    return;
                }
                bucket.time_until_available()
            };

            if wait_time > Duration::ZERO {
                debug!(
                    "Rate limiter: waiting {:?} for provider '{}'",
                    wait_time, self.provider
                );
                tokio::time::sleep(wait_time).await;
            }
        }
    }

    /// Take a token without waiting. Returns false if the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        self.lock_bucket().try_acquire()
    }

    pub fn remaining_tokens(&self) -> f64 {
        let mut bucket = self.lock_bucket();
        bucket.refill();
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_burst_then_empty() {
        let limiter = RateLimiter::new(Cow::Borrowed("POLYGON"), 5, 3);

        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::new(60, 1.0); // 1 token/second

        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        bucket.last_update = Instant::now() - Duration::from_secs(2);
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_remaining_tokens() {
        let limiter = RateLimiter::new(Cow::Borrowed("FRED"), 120, 5);

        limiter.try_acquire();
        limiter.try_acquire();

        let remaining = limiter.remaining_tokens();
        assert!(remaining >= 3.0 && remaining < 3.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_acquire_waits_for_refill() {
        // 100/second: one token every 10ms
        let limiter = RateLimiter::new(Cow::Borrowed("TRADIER"), 6000, 2);

        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_acquires_follow_the_paused_clock() {
        // 60/minute with a burst of 1: each extra token costs a second
        let limiter = RateLimiter::new(Cow::Borrowed("FRED"), 60, 1);

        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }
}
