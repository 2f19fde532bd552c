//! Provider trait definitions.

use async_trait::async_trait;

use super::descriptor::ProviderDescriptor;
use crate::errors::ResilienceError;
use crate::models::{Payload, ProviderRequest};

/// A market-data source.
///
/// Implement this trait to plug a new source into the registry. The
/// resilience layer handles breaking, retrying, pacing and caching; an
/// implementation only performs one attempt and classifies its failure.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use quantflow_resilience::provider::{DataProvider, ProviderDescriptor};
///
/// struct FixtureProvider {
///     descriptor: ProviderDescriptor,
/// }
///
/// #[async_trait]
/// impl DataProvider for FixtureProvider {
///     fn descriptor(&self) -> &ProviderDescriptor {
///         &self.descriptor
///     }
///
///     async fn fetch(&self, request: &ProviderRequest) -> Result<Payload, ResilienceError> {
///         Ok(std::fs::read(format!("fixtures/{}.json", request.endpoint))?)
///     }
/// }
/// ```
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn id(&self) -> &str {
        self.descriptor().id.as_ref()
    }

    /// Perform a single attempt.
    ///
    /// Failures must be reported as [`ResilienceError::Transient`] (timeouts,
    /// 5xx, 429) or [`ResilienceError::Permanent`] (everything else) so the
    /// retry executor can classify them.
    async fn fetch(&self, request: &ProviderRequest) -> Result<Payload, ResilienceError>;
}
