//! Static provider description and authentication strategy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::ProviderId;

/// How credentials are attached to each request.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthStrategy {
    /// Public endpoint.
    #[default]
    None,
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// Arbitrary header, e.g. `X-API-KEY: <value>`.
    Header { name: String, value: String },
    /// Query parameter, e.g. `?api_key=<value>`.
    QueryParam { name: String, value: String },
}

// Secrets must not end up in logs.
impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bearer { .. } => write!(f, "Bearer(***)"),
            Self::Header { name, .. } => write!(f, "Header({name}: ***)"),
            Self::QueryParam { name, .. } => write!(f, "QueryParam({name}=***)"),
        }
    }
}

/// Everything the resilience layer needs to know about a provider.
#[derive(Clone, Debug)]
pub struct ProviderDescriptor {
    /// Constant identifier like "POLYGON" or "FRED". Used for logging,
    /// breaker tracking, cache paths and source tags.
    pub id: ProviderId,

    pub base_url: String,

    pub auth: AuthStrategy,

    /// In-flight call limit; `None` uses the configured default.
    pub concurrency_limit: Option<usize>,

    /// Published quota, if any. Attempts are paced to stay under it.
    pub requests_per_minute: Option<u32>,

    /// Skip the file cache entirely (real-time sources).
    pub always_live: bool,

    /// Per-provider cache TTL; `None` uses the configured default.
    pub cache_ttl_days: Option<u32>,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<ProviderId>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            auth: AuthStrategy::None,
            concurrency_limit: None,
            requests_per_minute: None,
            always_live: false,
            cache_ttl_days: None,
        }
    }

    pub fn with_auth(mut self, auth: AuthStrategy) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }

    pub fn always_live(mut self) -> Self {
        self.always_live = true;
        self
    }

    pub fn with_cache_ttl_days(mut self, days: u32) -> Self {
        self.cache_ttl_days = Some(days);
        self
    }
}
