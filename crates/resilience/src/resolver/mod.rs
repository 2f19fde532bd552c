//! Fallback chain resolver.
//!
//! Serves one logical capability by walking its provider chain in order:
//!
//! 1. File cache lookup (skipped for always-live providers)
//! 2. Live call through the retry executor, gated by the provider's breaker
//! 3. On success, cache the payload and return it tagged with the provider
//! 4. On failure (exhausted retries or open circuit), try the next provider
//!
//! If the whole chain fails, non-critical capabilities degrade to their
//! configured default (tagged `"default"`, logged as a warning) and critical
//! capabilities return [`ResilienceError::AllProvidersExhausted`].

mod capability;

pub use capability::{Capability, ChainLink, Criticality};

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::cache::{CacheKey, FileCache};
use crate::errors::ResilienceError;
use crate::models::{FetchParams, ProviderRequest, Resolved};
use crate::registry::{AttemptOutcome, FetchDiagnostics, ProviderRegistry};
use crate::retry::RetryExecutor;

pub struct FallbackResolver {
    registry: Arc<ProviderRegistry>,
    cache: Arc<FileCache>,
    executor: RetryExecutor,
    capabilities: HashMap<String, Capability>,
}

impl FallbackResolver {
    pub fn new(registry: Arc<ProviderRegistry>, cache: Arc<FileCache>, executor: RetryExecutor) -> Self {
        Self {
            registry,
            cache,
            executor,
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability chain.
    ///
    /// Every provider in the chain must already be registered, and a name
    /// may only be registered once.
    pub fn add_capability(&mut self, capability: Capability) -> Result<(), ResilienceError> {
        if capability.links.is_empty() {
            return Err(ResilienceError::Config(format!(
                "capability '{}' has an empty provider chain",
                capability.name
            )));
        }
        if self.capabilities.contains_key(&*capability.name) {
            return Err(ResilienceError::Config(format!(
                "capability '{}' registered twice",
                capability.name
            )));
        }
        if let Some(missing) = capability
            .links
            .iter()
            .find(|link| !self.registry.contains(&link.provider_id))
        {
            return Err(ResilienceError::UnknownProvider(missing.provider_id.to_string()));
        }

        debug!(
            "Capability '{}' -> [{}] (critical: {})",
            capability.name,
            capability
                .links
                .iter()
                .map(|l| &*l.provider_id)
                .collect::<Vec<_>>()
                .join(", "),
            capability.is_critical()
        );
        self.capabilities
            .insert(capability.name.to_string(), capability);
        Ok(())
    }

    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    /// Resolve a capability to a value and its source tag.
    pub async fn resolve(
        &self,
        capability: &str,
        params: &FetchParams,
    ) -> Result<Resolved, ResilienceError> {
        self.resolve_with_diagnostics(capability, params).await.0
    }

    /// Resolve a capability, also returning what happened at each provider.
    pub async fn resolve_with_diagnostics(
        &self,
        capability: &str,
        params: &FetchParams,
    ) -> (Result<Resolved, ResilienceError>, FetchDiagnostics) {
        let mut diagnostics = FetchDiagnostics::new();

        let Some(chain) = self.capabilities.get(capability) else {
            return (
                Err(ResilienceError::UnknownCapability(capability.to_string())),
                diagnostics,
            );
        };

        for link in &chain.links {
            let provider_id = link.provider_id.clone();
            let Some(handle) = self.registry.get(&provider_id) else {
                diagnostics.record(provider_id, AttemptOutcome::Failed("not registered".to_string()));
                continue;
            };

            let request = ProviderRequest::new(link.endpoint.clone(), params);
            let use_cache = !handle.descriptor().always_live;
            let key = CacheKey::for_request(handle.id(), &request);

            if use_cache {
                if let Some(value) = self.cache.get(&key) {
                    debug!("'{}' served from '{}' cache", capability, provider_id);
                    diagnostics.record(provider_id.clone(), AttemptOutcome::CacheHit);
                    return (Ok(Resolved::cached(value, provider_id)), diagnostics);
                }
            }

            match self.executor.execute(&handle, &request).await {
                Ok(value) => {
                    if use_cache {
                        let ttl = handle
                            .descriptor()
                            .cache_ttl_days
                            .unwrap_or_else(|| self.cache.default_ttl_days());
                        if let Err(e) = self.cache.put(&key, &value, request.range, ttl) {
                            warn!("Failed to cache '{}' from '{}': {}", capability, provider_id, e);
                        }
                    }
                    diagnostics.record(provider_id.clone(), AttemptOutcome::Success);
                    return (Ok(Resolved::live(value, provider_id)), diagnostics);
                }
                Err(ResilienceError::BreakerOpen { .. }) => {
                    debug!(
                        "Circuit open for '{}', skipping for '{}'",
                        provider_id, capability
                    );
                    diagnostics.record(provider_id, AttemptOutcome::BreakerOpen);
                }
                Err(e) => {
                    info!(
                        "Provider '{}' failed for '{}': {}, trying next provider",
                        provider_id, capability, e
                    );
                    diagnostics.record(provider_id, AttemptOutcome::Failed(e.to_string()));
                }
            }
        }

        let result = match &chain.criticality {
            Criticality::NonCritical { default } => {
                diagnostics.used_default = true;
                warn!(
                    "All providers failed for '{}', using default ({})",
                    capability,
                    diagnostics.summary()
                );
                Ok(Resolved::default_value(default.clone()))
            }
            Criticality::Critical => {
                error!(
                    "All providers failed for critical capability '{}' ({})",
                    capability,
                    diagnostics.summary()
                );
                Err(ResilienceError::AllProvidersExhausted {
                    capability: capability.to_string(),
                    attempts: diagnostics.failures(),
                })
            }
        };
        (result, diagnostics)
    }
}
