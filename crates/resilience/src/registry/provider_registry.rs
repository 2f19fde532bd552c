//! Provider registry.
//!
//! The registry owns one [`ProviderHandle`] per provider: the provider
//! itself plus the shared state every caller of that provider must go
//! through (circuit breaker, in-flight semaphore, optional pacing). It is
//! built once at startup and shared behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Semaphore, SemaphorePermit};

use super::{BreakerStore, CircuitBreaker, CircuitState, RateLimiter};
use crate::clock::Clock;
use crate::config::{BreakerConfig, DispatchConfig, ResilienceConfig};
use crate::errors::ResilienceError;
use crate::models::{Payload, ProviderRequest};
use crate::provider::{DataProvider, ProviderDescriptor};

/// A provider together with its shared resilience state.
pub struct ProviderHandle {
    provider: Arc<dyn DataProvider>,
    breaker: Arc<CircuitBreaker>,
    semaphore: Arc<Semaphore>,
    concurrency_limit: usize,
    rate_limiter: Option<RateLimiter>,
}

impl ProviderHandle {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        breaker: Arc<CircuitBreaker>,
        concurrency_limit: usize,
    ) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        let descriptor = provider.descriptor();
        let rate_limiter = descriptor
            .requests_per_minute
            .map(|rpm| RateLimiter::new(descriptor.id.clone(), rpm, concurrency_limit));

        Self {
            provider,
            breaker,
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
            rate_limiter,
        }
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        self.provider.descriptor()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.concurrency_limit - self.semaphore.available_permits()
    }

    /// Wait for an in-flight permit and, if the provider is paced, a token.
    ///
    /// The breaker must be consulted only after this returns, so that a
    /// call queued behind the permit sees any trip that happened meanwhile.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, ResilienceError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ResilienceError::Cancelled)?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
        Ok(permit)
    }

    /// Fetch with `timeout` applied to the network call only. The caller
    /// holds the permit from [`acquire`](Self::acquire).
    pub async fn fetch_with_timeout(
        &self,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<Payload, ResilienceError> {
        debug!(
            "Calling '{}' endpoint '{}' ({} in flight)",
            self.id(),
            request.endpoint,
            self.in_flight()
        );

        match tokio::time::timeout(timeout, self.provider.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(ResilienceError::timeout(self.id())),
        }
    }

    /// One unguarded attempt: [`acquire`](Self::acquire) then
    /// [`fetch_with_timeout`](Self::fetch_with_timeout). The breaker is
    /// neither consulted nor updated.
    pub async fn call(
        &self,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<Payload, ResilienceError> {
        let _permit = self.acquire().await?;
        self.fetch_with_timeout(request, timeout).await
    }
}

/// Registry of every provider the pipeline may call.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderHandle>>,
    breaker_config: BreakerConfig,
    dispatch_config: DispatchConfig,
    clock: Arc<dyn Clock>,
    store: Option<BreakerStore>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    ///
    /// If `persistence.breaker_state_dir` is set, breakers are restored
    /// from it on registration and [`persist_breakers`](Self::persist_breakers)
    /// writes to it.
    pub fn new(config: &ResilienceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: HashMap::new(),
            breaker_config: config.breaker.clone(),
            dispatch_config: config.dispatch.clone(),
            clock,
            store: config
                .persistence
                .breaker_state_dir
                .as_ref()
                .map(BreakerStore::new),
        }
    }

    /// Register a provider. Ids must be unique.
    pub fn register(&mut self, provider: Arc<dyn DataProvider>) -> Result<(), ResilienceError> {
        let id = provider.id().to_string();
        if self.providers.contains_key(&id) {
            return Err(ResilienceError::Config(format!(
                "provider '{id}' registered twice"
            )));
        }

        let descriptor = provider.descriptor();
        let limit = descriptor
            .concurrency_limit
            .unwrap_or_else(|| self.dispatch_config.concurrency_for(&id));

        let breaker = match self.store.as_ref().and_then(|s| s.load(&id)) {
            Some(snapshot) => CircuitBreaker::restore(
                snapshot,
                self.breaker_config.clone(),
                self.clock.clone(),
            ),
            None => CircuitBreaker::new(
                descriptor.id.clone(),
                self.breaker_config.clone(),
                self.clock.clone(),
            ),
        };

        info!(
            "Registered provider '{}' (concurrency {}, always live: {})",
            id, limit, descriptor.always_live
        );
        let handle = ProviderHandle::new(provider, Arc::new(breaker), limit);
        self.providers.insert(id, Arc::new(handle));
        Ok(())
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Registered provider ids, sorted.
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Check if a provider's circuit is open.
    pub fn is_circuit_open(&self, provider_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .map(|h| h.breaker().state() == CircuitState::Open)
            .unwrap_or(false)
    }

    /// Reset a provider's circuit breaker.
    pub fn reset_circuit(&self, provider_id: &str) {
        if let Some(handle) = self.providers.get(provider_id) {
            handle.breaker().reset();
        }
    }

    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .providers
            .iter()
            .map(|(id, h)| (id.clone(), h.breaker().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Write every breaker's state to the store. Returns how many were saved.
    ///
    /// A failure for one provider is logged and does not stop the others.
    pub fn persist_breakers(&self) -> Result<usize, ResilienceError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut saved = 0;
        for (id, handle) in &self.providers {
            match store.save(&handle.breaker().snapshot()) {
                Ok(()) => saved += 1,
                Err(e) => warn!("Failed to persist breaker for '{}': {}", id, e),
            }
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::FetchParams;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowProvider {
        descriptor: ProviderDescriptor,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl SlowProvider {
        fn new(descriptor: ProviderDescriptor, delay: Duration) -> Self {
            Self {
                descriptor,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl DataProvider for SlowProvider {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        async fn fetch(&self, _request: &ProviderRequest) -> Result<Payload, ResilienceError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(b"ok".to_vec())
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 20, 14, 30, 0).unwrap(),
        ))
    }

    fn request() -> ProviderRequest {
        ProviderRequest::new(
            "quote",
            &FetchParams::new(NaiveDate::from_ymd_opt(2026, 2, 20).unwrap()),
        )
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ProviderRegistry::new(&ResilienceConfig::default(), clock());
        let descriptor = ProviderDescriptor::new("POLYGON", "https://api.polygon.io");

        registry
            .register(Arc::new(SlowProvider::new(descriptor.clone(), Duration::ZERO)))
            .unwrap();
        let result = registry.register(Arc::new(SlowProvider::new(descriptor, Duration::ZERO)));
        assert!(matches!(result, Err(ResilienceError::Config(_))));
    }

    #[test]
    fn test_concurrency_limit_from_config() {
        let mut config = ResilienceConfig::default();
        config
            .dispatch
            .provider_concurrency
            .insert("FRED".to_string(), 2);
        let mut registry = ProviderRegistry::new(&config, clock());

        registry
            .register(Arc::new(SlowProvider::new(
                ProviderDescriptor::new("FRED", "https://api.stlouisfed.org"),
                Duration::ZERO,
            )))
            .unwrap();
        registry
            .register(Arc::new(SlowProvider::new(
                ProviderDescriptor::new("CBOE", "https://cdn.cboe.com").with_concurrency_limit(9),
                Duration::ZERO,
            )))
            .unwrap();

        assert_eq!(registry.get("FRED").unwrap().concurrency_limit(), 2);
        assert_eq!(registry.get("CBOE").unwrap().concurrency_limit(), 9);
        assert_eq!(registry.provider_ids(), vec!["CBOE", "FRED"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_semaphore_bounds_in_flight_calls() {
        let provider = Arc::new(SlowProvider::new(
            ProviderDescriptor::new("POLYGON", "https://api.polygon.io").with_concurrency_limit(2),
            Duration::from_millis(20),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            "POLYGON".into(),
            BreakerConfig::default(),
            clock(),
        ));
        let handle = Arc::new(ProviderHandle::new(provider.clone(), breaker, 2));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.call(&request(), Duration::from_secs(5)).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(provider.peak.load(Ordering::SeqCst), 2);
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let provider = Arc::new(SlowProvider::new(
            ProviderDescriptor::new("SLOW", "https://slow.example"),
            Duration::from_millis(200),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            "SLOW".into(),
            BreakerConfig::default(),
            clock(),
        ));
        let handle = ProviderHandle::new(provider, breaker, 1);

        let result = handle.call(&request(), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ResilienceError::Transient { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_provider_waits_for_tokens() {
        let provider = Arc::new(SlowProvider::new(
            ProviderDescriptor::new("FRED", "https://api.stlouisfed.org").with_requests_per_minute(60),
            Duration::ZERO,
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            "FRED".into(),
            BreakerConfig::default(),
            clock(),
        ));
        // Burst equals the concurrency limit: 2 immediate, then 1/second.
        let handle = ProviderHandle::new(provider, breaker, 2);

        let start = tokio::time::Instant::now();
        for _ in 0..4 {
            assert!(handle.call(&request(), Duration::from_secs(5)).await.is_ok());
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[test]
    fn test_breakers_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ResilienceConfig::default();
        config.breaker.window_size = 1;
        config.persistence.breaker_state_dir = Some(dir.path().to_path_buf());
        let clock = clock();

        let mut registry = ProviderRegistry::new(&config, clock.clone());
        registry
            .register(Arc::new(SlowProvider::new(
                ProviderDescriptor::new("POLYGON", "https://api.polygon.io"),
                Duration::ZERO,
            )))
            .unwrap();
        registry.get("POLYGON").unwrap().breaker().record_outcome(false);
        assert!(registry.is_circuit_open("POLYGON"));
        assert_eq!(registry.persist_breakers().unwrap(), 1);

        let mut next_run = ProviderRegistry::new(&config, clock);
        next_run
            .register(Arc::new(SlowProvider::new(
                ProviderDescriptor::new("POLYGON", "https://api.polygon.io"),
                Duration::ZERO,
            )))
            .unwrap();
        assert!(next_run.is_circuit_open("POLYGON"));

        next_run.reset_circuit("POLYGON");
        assert_eq!(
            next_run.breaker_states(),
            vec![("POLYGON".to_string(), CircuitState::Closed)]
        );
    }
}
