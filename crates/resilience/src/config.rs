//! Configuration for the resilience layer.
//!
//! All sections deserialize with defaults, so a config file only needs to
//! name the values it changes. Environment variables prefixed `QF_`
//! override file values (see [`ResilienceConfig::apply_env_overrides`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ResilienceError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub dispatch: DispatchConfig,
    pub dedup: DedupConfig,
    pub persistence: PersistenceConfig,
}

/// Circuit breaker thresholds, shared by every provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    /// Number of most recent outcomes in the sliding window (default: 50)
    pub window_size: usize,

    /// Failure ratio above which a full window trips the breaker (default: 0.30)
    pub error_threshold: f64,

    /// Seconds an open breaker waits before allowing a probe (default: 60)
    pub cooldown_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            error_threshold: 0.30,
            cooldown_seconds: 60,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_seconds as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3)
    pub max_retries: u32,

    /// Sleep before retry `n` is `n * base_delay_ms` (default: 500)
    pub base_delay_ms: u64,

    /// Upper bound for a single attempt (default: 30s)
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub enabled: bool,

    /// Root directory for cached responses.
    pub dir: PathBuf,

    /// Entries older than this many days are misses (default: 7)
    pub ttl_days: u32,

    /// File extension for cache entries.
    pub extension: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/cache"),
            ttl_days: 7,
            extension: "json".to_string(),
        }
    }
}

/// How batches of logical requests are scheduled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One request at a time, in input order.
    Sequential,
    /// Many requests in flight, bounded per provider and per batch.
    #[default]
    Concurrent,
}

impl std::str::FromStr for ExecutionMode {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "sync" => Ok(Self::Sequential),
            "concurrent" | "async" => Ok(Self::Concurrent),
            other => Err(ResilienceError::Config(format!(
                "unknown execution mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    pub mode: ExecutionMode,

    /// Logical entities (e.g. tickers) processed at once (default: 8)
    pub max_concurrent_entities: usize,

    /// In-flight calls per provider unless overridden (default: 5)
    pub default_provider_concurrency: usize,

    /// Per-provider in-flight limits, keyed by provider id.
    pub provider_concurrency: HashMap<String, usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Concurrent,
            max_concurrent_entities: 8,
            default_provider_concurrency: 5,
            provider_concurrency: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    pub fn concurrency_for(&self, provider: &str) -> usize {
        self.provider_concurrency
            .get(provider)
            .copied()
            .unwrap_or(self.default_provider_concurrency)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DedupConfig {
    /// Hours a recorded signal suppresses equivalents (default: 24)
    pub ttl_hours: u32,

    /// Ledger file; `None` keeps the ledger in memory only.
    pub ledger_path: Option<PathBuf>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            ledger_path: Some(PathBuf::from("data/signal_ledger.json")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistenceConfig {
    /// Directory for per-provider breaker records; `None` disables persistence.
    pub breaker_state_dir: Option<PathBuf>,
}

impl ResilienceConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ResilienceError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ResilienceError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ResilienceError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `QF_*` environment overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ResilienceError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ResilienceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QF_BREAKER_WINDOW") {
            self.breaker.window_size = parse_env("QF_BREAKER_WINDOW", &v)?;
        }
        if let Some(v) = lookup("QF_BREAKER_THRESHOLD") {
            self.breaker.error_threshold = parse_env("QF_BREAKER_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("QF_BREAKER_COOLDOWN_SECS") {
            self.breaker.cooldown_seconds = parse_env("QF_BREAKER_COOLDOWN_SECS", &v)?;
        }
        if let Some(v) = lookup("QF_RETRY_MAX") {
            self.retry.max_retries = parse_env("QF_RETRY_MAX", &v)?;
        }
        if let Some(v) = lookup("QF_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_env("QF_RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("QF_REQUEST_TIMEOUT_SECS") {
            self.retry.request_timeout_secs = parse_env("QF_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("QF_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("QF_CACHE_ENABLED", &v)?;
        }
        if let Some(v) = lookup("QF_CACHE_DIR") {
            self.cache.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("QF_CACHE_TTL_DAYS") {
            self.cache.ttl_days = parse_env("QF_CACHE_TTL_DAYS", &v)?;
        }
        if let Some(v) = lookup("QF_EXECUTION_MODE") {
            self.dispatch.mode = v.parse()?;
        }
        if let Some(v) = lookup("QF_MAX_CONCURRENT_ENTITIES") {
            self.dispatch.max_concurrent_entities = parse_env("QF_MAX_CONCURRENT_ENTITIES", &v)?;
        }
        if let Some(v) = lookup("QF_PROVIDER_CONCURRENCY") {
            self.dispatch.default_provider_concurrency =
                parse_env("QF_PROVIDER_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("QF_DEDUP_TTL_HOURS") {
            self.dedup.ttl_hours = parse_env("QF_DEDUP_TTL_HOURS", &v)?;
        }
        if let Some(v) = lookup("QF_DEDUP_LEDGER") {
            self.dedup.ledger_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("QF_BREAKER_STATE_DIR") {
            self.persistence.breaker_state_dir = Some(PathBuf::from(v));
        }
        self.validate()
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.breaker.window_size == 0 {
            return Err(ResilienceError::Config(
                "breaker.windowSize must be at least 1".to_string(),
            ));
        }
        if !(self.breaker.error_threshold > 0.0 && self.breaker.error_threshold < 1.0) {
            return Err(ResilienceError::Config(format!(
                "breaker.errorThreshold must be in (0, 1), got {}",
                self.breaker.error_threshold
            )));
        }
        if self.dispatch.max_concurrent_entities == 0 {
            return Err(ResilienceError::Config(
                "dispatch.maxConcurrentEntities must be at least 1".to_string(),
            ));
        }
        if self.dispatch.default_provider_concurrency == 0 {
            return Err(ResilienceError::Config(
                "dispatch.defaultProviderConcurrency must be at least 1".to_string(),
            ));
        }
        if let Some((provider, _)) = self
            .dispatch
            .provider_concurrency
            .iter()
            .find(|(_, limit)| **limit == 0)
        {
            return Err(ResilienceError::Config(format!(
                "dispatch.providerConcurrency for '{provider}' must be at least 1"
            )));
        }
        if self.dedup.ttl_hours == 0 {
            return Err(ResilienceError::Config(
                "dedup.ttlHours must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ResilienceError> {
    value
        .trim()
        .parse()
        .map_err(|_| ResilienceError::Config(format!("{name}: cannot parse '{value}'")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ResilienceError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ResilienceError::Config(format!(
            "{name}: expected a boolean, got '{value}'"
        ))),
    }
}
