//! QuantFlow Resilience Crate
//!
//! This crate is the layer every pipeline phase goes through to talk to
//! market-data providers: it decides whether a call may be made, retries it,
//! caches its response, falls back to the next source, bounds concurrency
//! and keeps signals from being emitted twice.
//!
//! # Overview
//!
//! - Per-provider sliding-window circuit breakers, optionally persisted
//! - Retry executor with linear backoff, gated by the breaker
//! - Atomically written, TTL- and forward-date-aware file cache
//! - Ordered fallback chains with critical/non-critical defaults
//! - Bounded, fault-isolated batch dispatch with input-order results
//! - Hash ledger for signal deduplication
//!
//! # Architecture
//!
//! ```text
//!                 +--------------------+
//!   phases -----> |     Dispatcher     |  (entity cap, per-item isolation)
//!      |          +--------------------+
//!      |                    |
//!      v                    v
//!          +--------------------------+
//!          |     FallbackResolver     |  (capability -> ordered chain)
//!          +--------------------------+
//!              |                 |
//!              v                 v
//!      +---------------+   +---------------+
//!      |   FileCache   |   | RetryExecutor |
//!      +---------------+   +---------------+
//!                                |
//!                                v
//!                     +--------------------+
//!                     |   ProviderHandle   |  (breaker, semaphore, pacing)
//!                     +--------------------+
//!                                |
//!                                v
//!                     +--------------------+
//!                     |    DataProvider    |  (HttpProvider, ...)
//!                     +--------------------+
//!
//!   emission ------> SignalDeduplicator    (independent of the fetch path)
//! ```
//!
//! # Core Types
//!
//! - [`Resilience`] - All components, wired by [`build_runtime`]
//! - [`FallbackResolver`] / [`Capability`] - Chains and their resolution
//! - [`Dispatcher`] - Batched resolution
//! - [`CircuitBreaker`] - Per-provider gate
//! - [`FileCache`] - Response cache
//! - [`SignalDeduplicator`] - Emission ledger
//! - [`Resolved`] - A value tagged with its [`SourceTag`]

pub mod cache;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod errors;
pub mod models;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod runtime;
pub mod storage;

// Re-export the types phases use day to day
pub use cache::{CacheKey, FileCache, PurgeStats, PutOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ExecutionMode, ResilienceConfig};
pub use dedup::{signal_hash, SignalDeduplicator};
pub use dispatch::{DispatchRequest, Dispatcher};
pub use errors::{ProviderFailure, ResilienceError, RetryClass};
pub use models::{DateRange, FetchParams, Payload, ProviderId, ProviderRequest, Resolved, SourceTag};
pub use provider::{AuthStrategy, DataProvider, HttpProvider, ProviderDescriptor, ResponseParser};
pub use registry::{CircuitBreaker, CircuitState, FetchDiagnostics, ProviderRegistry};
pub use resolver::{Capability, Criticality, FallbackResolver};
pub use retry::RetryExecutor;
pub use runtime::{build_runtime, Resilience};
