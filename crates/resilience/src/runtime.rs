//! Composition root.
//!
//! [`build_runtime`] wires every component once at startup from a
//! [`ResilienceConfig`], a clock, the concrete providers and the capability
//! chains. Pipeline phases receive the resulting `Arc<Resilience>` and never
//! construct breakers, caches or ledgers themselves.

use std::sync::Arc;

use log::{info, warn};
use tokio::time::Instant;

use crate::cache::FileCache;
use crate::clock::Clock;
use crate::config::ResilienceConfig;
use crate::dedup::SignalDeduplicator;
use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::errors::ResilienceError;
use crate::models::{FetchParams, Resolved};
use crate::provider::DataProvider;
use crate::registry::{FetchDiagnostics, ProviderRegistry};
use crate::resolver::{Capability, FallbackResolver};
use crate::retry::RetryExecutor;

pub struct Resilience {
    pub config: ResilienceConfig,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<ProviderRegistry>,
    pub cache: Arc<FileCache>,
    pub resolver: Arc<FallbackResolver>,
    pub dispatcher: Arc<Dispatcher>,
    pub dedup: Arc<SignalDeduplicator>,
}

/// Validate `config`, register providers and chains, and load persisted
/// breaker and ledger state.
pub fn build_runtime(
    config: &ResilienceConfig,
    clock: Arc<dyn Clock>,
    providers: Vec<Arc<dyn DataProvider>>,
    capabilities: Vec<Capability>,
) -> Result<Arc<Resilience>, ResilienceError> {
    config.validate()?;

    let mut registry = ProviderRegistry::new(config, clock.clone());
    for provider in providers {
        registry.register(provider)?;
    }
    let registry = Arc::new(registry);

    let cache = Arc::new(FileCache::new(&config.cache, clock.clone()));
    if !cache.is_enabled() {
        warn!("File cache disabled, every resolve goes to the network");
    }

    let mut resolver = FallbackResolver::new(
        registry.clone(),
        cache.clone(),
        RetryExecutor::new(config.retry.clone()),
    );
    for capability in capabilities {
        resolver.add_capability(capability)?;
    }
    let resolver = Arc::new(resolver);

    let dispatcher = Arc::new(Dispatcher::new(resolver.clone(), &config.dispatch));

    let dedup = Arc::new(SignalDeduplicator::new(&config.dedup, clock.clone()));
    dedup.load()?;

    info!(
        "Resilience layer ready: {} providers, mode {:?}, cache {}",
        registry.provider_ids().len(),
        config.dispatch.mode,
        if cache.is_enabled() { "on" } else { "off" }
    );

    Ok(Arc::new(Resilience {
        config: config.clone(),
        clock,
        registry,
        cache,
        resolver,
        dispatcher,
        dedup,
    }))
}

impl Resilience {
    pub async fn resolve(
        &self,
        capability: &str,
        params: &FetchParams,
    ) -> Result<Resolved, ResilienceError> {
        self.resolver.resolve(capability, params).await
    }

    pub async fn resolve_with_diagnostics(
        &self,
        capability: &str,
        params: &FetchParams,
    ) -> (Result<Resolved, ResilienceError>, FetchDiagnostics) {
        self.resolver.resolve_with_diagnostics(capability, params).await
    }

    pub async fn dispatch_many(
        &self,
        requests: Vec<DispatchRequest>,
    ) -> Vec<Result<Resolved, ResilienceError>> {
        self.dispatcher.dispatch_many(requests).await
    }

    pub async fn dispatch_many_with_deadline(
        &self,
        requests: Vec<DispatchRequest>,
        deadline: Instant,
    ) -> Vec<Result<Resolved, ResilienceError>> {
        self.dispatcher
            .dispatch_many_with_deadline(requests, deadline)
            .await
    }

    /// Persist breaker state and the dedup ledger at the end of a run.
    ///
    /// Both are attempted; the first error is returned.
    pub fn shutdown(&self) -> Result<(), ResilienceError> {
        let breakers = self.registry.persist_breakers();
        let ledger = self.dedup.persist();
        let saved = breakers?;
        ledger?;
        info!("Persisted {} breaker records and {} ledger entries", saved, self.dedup.len());
        Ok(())
    }
}
