//! Concurrency dispatcher.
//!
//! Runs a batch of logical requests (one per ticker, typically) with:
//! - an overall cap on entities in flight (`max_concurrent_entities`)
//! - per-provider in-flight limits, enforced by each provider's semaphore
//!   inside [`ProviderHandle::call`](crate::registry::ProviderHandle::call)
//! - per-item fault isolation: every item runs in its own task, so an error
//!   or panic becomes that item's result and never touches its siblings
//! - results in input order, regardless of completion order
//!
//! In [`ExecutionMode::Sequential`] items run one after another through the
//! same code path.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::config::{DispatchConfig, ExecutionMode};
use crate::errors::ResilienceError;
use crate::models::{FetchParams, Resolved};
use crate::resolver::FallbackResolver;

/// One logical request in a batch.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub capability: String,
    pub params: FetchParams,
}

impl DispatchRequest {
    pub fn new(capability: impl Into<String>, params: FetchParams) -> Self {
        Self {
            capability: capability.into(),
            params,
        }
    }
}

pub struct Dispatcher {
    resolver: Arc<FallbackResolver>,
    entity_limit: Arc<Semaphore>,
    max_concurrent_entities: usize,
    mode: ExecutionMode,
}

impl Dispatcher {
    pub fn new(resolver: Arc<FallbackResolver>, config: &DispatchConfig) -> Self {
        let max_concurrent_entities = config.max_concurrent_entities.max(1);
        Self {
            resolver,
            entity_limit: Arc::new(Semaphore::new(max_concurrent_entities)),
            max_concurrent_entities,
            mode: config.mode,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn max_concurrent_entities(&self) -> usize {
        self.max_concurrent_entities
    }

    /// Resolve every request, one result per request in input order.
    pub async fn dispatch_many(
        &self,
        requests: Vec<DispatchRequest>,
    ) -> Vec<Result<Resolved, ResilienceError>> {
        let resolver = self.resolver.clone();
        self.run_many(requests, move |request: DispatchRequest| {
            let resolver = resolver.clone();
            async move { resolver.resolve(&request.capability, &request.params).await }
        })
        .await
    }

    /// Like [`dispatch_many`](Self::dispatch_many), but gives up at `deadline`.
    ///
    /// Items finished by then keep their results; unfinished items are
    /// aborted and reported as [`ResilienceError::Cancelled`].
    pub async fn dispatch_many_with_deadline(
        &self,
        requests: Vec<DispatchRequest>,
        deadline: Instant,
    ) -> Vec<Result<Resolved, ResilienceError>> {
        let resolver = self.resolver.clone();
        self.run_many_with_deadline(
            requests,
            move |request: DispatchRequest| {
                let resolver = resolver.clone();
                async move { resolver.resolve(&request.capability, &request.params).await }
            },
            deadline,
        )
        .await
    }

    /// Run `task` over `items` under the dispatcher's limits.
    ///
    /// Phases use this directly for per-entity work that spans several
    /// capabilities (e.g. chain + bars + quote for one ticker).
    pub async fn run_many<T, R, F, Fut>(&self, items: Vec<T>, task: F) -> Vec<Result<R, ResilienceError>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ResilienceError>> + Send + 'static,
    {
        let task = Arc::new(task);
        let total = items.len();
        debug!("Dispatching {} items ({:?})", total, self.mode);

        match self.mode {
            ExecutionMode::Concurrent => {
                let handles: Vec<_> = items
                    .into_iter()
                    .map(|item| self.spawn(item, task.clone()))
                    .collect();
                futures::future::join_all(handles)
                    .await
                    .into_iter()
                    .map(flatten_join)
                    .collect()
            }
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(total);
                for item in items {
                    let joined = self.spawn(item, task.clone()).await;
                    results.push(flatten_join(joined));
                }
                results
            }
        }
    }

    /// [`run_many`](Self::run_many) with a deadline for the whole batch.
    pub async fn run_many_with_deadline<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        task: F,
        deadline: Instant,
    ) -> Vec<Result<R, ResilienceError>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ResilienceError>> + Send + 'static,
    {
        let task = Arc::new(task);
        let mut results = Vec::with_capacity(items.len());

        match self.mode {
            ExecutionMode::Concurrent => {
                let handles: Vec<_> = items
                    .into_iter()
                    .map(|item| self.spawn(item, task.clone()))
                    .collect();
                // Completed items are collected even after the deadline:
                // `timeout_at` polls the handle before checking the clock.
                for handle in handles {
                    results.push(join_by(handle, deadline).await);
                }
            }
            ExecutionMode::Sequential => {
                for item in items {
                    if Instant::now() >= deadline {
                        results.push(Err(ResilienceError::Cancelled));
                        continue;
                    }
                    let handle = self.spawn(item, task.clone());
                    results.push(join_by(handle, deadline).await);
                }
            }
        }

        let cancelled = results
            .iter()
            .filter(|r| matches!(r, Err(ResilienceError::Cancelled)))
            .count();
        if cancelled > 0 {
            warn!(
                "Batch deadline reached: {} of {} items cancelled",
                cancelled,
                results.len()
            );
        }
        results
    }

    fn spawn<T, R, F, Fut>(&self, item: T, task: Arc<F>) -> JoinHandle<Result<R, ResilienceError>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ResilienceError>> + Send + 'static,
    {
        let limit = self.entity_limit.clone();
        tokio::spawn(async move {
            let _permit = limit
                .acquire_owned()
                .await
                .map_err(|_| ResilienceError::Cancelled)?;
            task(item).await
        })
    }
}

async fn join_by<R>(
    mut handle: JoinHandle<Result<R, ResilienceError>>,
    deadline: Instant,
) -> Result<R, ResilienceError> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(joined) => flatten_join(joined),
        Err(_) => {
            handle.abort();
            Err(ResilienceError::Cancelled)
        }
    }
}

fn flatten_join<R>(
    joined: Result<Result<R, ResilienceError>, JoinError>,
) -> Result<R, ResilienceError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!("Dispatched item panicked: {}", message);
            Err(ResilienceError::TaskFailed(message))
        }
        Err(_) => Err(ResilienceError::Cancelled),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileCache;
    use crate::clock::ManualClock;
    use crate::config::{ResilienceConfig, RetryConfig};
    use crate::registry::ProviderRegistry;
    use crate::retry::RetryExecutor;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn dispatcher(mode: ExecutionMode, max_concurrent_entities: usize) -> Dispatcher {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 20, 15, 0, 0).unwrap(),
        ));
        let mut config = ResilienceConfig::default();
        config.cache.enabled = false;
        let registry = Arc::new(ProviderRegistry::new(&config, clock.clone()));
        let cache = Arc::new(FileCache::new(&config.cache, clock));
        let resolver = Arc::new(FallbackResolver::new(
            registry,
            cache,
            RetryExecutor::new(RetryConfig::default()),
        ));
        Dispatcher::new(
            resolver,
            &DispatchConfig {
                mode,
                max_concurrent_entities,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order() {
        let dispatcher = dispatcher(ExecutionMode::Concurrent, 8);
        // Later items finish first.
        let items: Vec<u64> = vec![50, 40, 30, 20, 10];

        let results = dispatcher
            .run_many(items.clone(), |delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(delay)
            })
            .await;

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, items);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_siblings() {
        let dispatcher = dispatcher(ExecutionMode::Concurrent, 4);

        let results = dispatcher
            .run_many((0..10).collect::<Vec<usize>>(), |i| async move {
                if i == 3 {
                    Err(ResilienceError::Transient {
                        provider: "POLYGON".to_string(),
                        reason: "HTTP 429".to_string(),
                    })
                } else {
                    Ok(i * 2)
                }
            })
            .await;

        assert_eq!(results.len(), 10);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert!(results[3].is_err());
        assert_eq!(*results[9].as_ref().unwrap(), 18);
    }

    #[tokio::test]
    async fn test_panic_is_captured_as_item_failure() {
        let dispatcher = dispatcher(ExecutionMode::Concurrent, 4);

        let results = dispatcher
            .run_many(vec!["SPY", "BOOM", "QQQ"], |ticker| async move {
                if ticker == "BOOM" {
                    panic!("bad payload for {ticker}");
                }
                Ok(ticker.len())
            })
            .await;

        assert!(results[0].is_ok());
        assert!(results[2].is_ok());
        match &results[1] {
            Err(ResilienceError::TaskFailed(message)) => assert!(message.contains("BOOM")),
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_entity_cap_is_respected() {
        let dispatcher = dispatcher(ExecutionMode::Concurrent, 3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        let results = dispatcher
            .run_many((0..12).collect::<Vec<u32>>(), move |i| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }
            })
            .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_mode_runs_one_at_a_time() {
        let dispatcher = dispatcher(ExecutionMode::Sequential, 8);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        let results = dispatcher
            .run_many(vec![3u64, 1, 2], move |delay| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(delay)
                }
            })
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![3, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_completed_results() {
        let dispatcher = dispatcher(ExecutionMode::Concurrent, 8);
        let deadline = Instant::now() + Duration::from_millis(100);

        let results = dispatcher
            .run_many_with_deadline(
                vec![10u64, 5_000, 20],
                |delay| async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(delay)
                },
                deadline,
            )
            .await;

        assert_eq!(*results[0].as_ref().unwrap(), 10);
        assert!(matches!(results[1], Err(ResilienceError::Cancelled)));
        assert_eq!(*results[2].as_ref().unwrap(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_deadline_cancels_remaining_items() {
        let dispatcher = dispatcher(ExecutionMode::Sequential, 8);
        let deadline = Instant::now() + Duration::from_millis(100);

        let results = dispatcher
            .run_many_with_deadline(
                vec![60u64, 60, 10],
                |delay| async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(delay)
                },
                deadline,
            )
            .await;

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ResilienceError::Cancelled)));
        assert!(matches!(results[2], Err(ResilienceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unknown_capability_is_an_item_result() {
        let dispatcher = dispatcher(ExecutionMode::Concurrent, 2);
        let params = FetchParams::new(chrono::NaiveDate::from_ymd_opt(2026, 2, 19).unwrap());

        let results = dispatcher
            .dispatch_many(vec![
                DispatchRequest::new("VIX", params.clone()),
                DispatchRequest::new("GEX", params),
            ])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(ResilienceError::UnknownCapability(_)))));
    }
}
