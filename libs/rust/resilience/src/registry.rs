//! Process-wide registry of breakers and caches.
//!
//! An explicit context object owned by the service root and passed to
//! callers; nothing here is a module-level singleton, so tests get isolated
//! registries for free. Breakers are keyed by upstream name and caches by
//! namespace, both created lazily and memoized for process lifetime (the set
//! of upstream names is small and known, so registry entries are never
//! evicted).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::Future;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::breaker::{BreakerConfig, BreakerStats, CircuitBreaker, StateChangeListener};
use crate::cache::{CacheOptions, CacheSnapshot, CacheStats, ResponseCache};
use crate::error::UpstreamError;
use crate::retry::{with_retry, RetryPolicy};

/// Options for [`UpstreamRegistry::execute`]: breaker configuration applied
/// on first use of the upstream name, plus the retry policy wrapped inside
/// the breaker. `retry: None` runs the operation exactly once per breaker
/// admission.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub breaker: BreakerConfig,
    pub retry: Option<RetryPolicy>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: Some(RetryPolicy::default()),
        }
    }
}

impl ExecuteOptions {
    /// Defaults with the named upstream's retry predicate plugged in.
    pub fn for_upstream(name: &str) -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: Some(RetryPolicy::for_upstream(name)),
        }
    }
}

struct CacheHandle {
    any: Arc<dyn Any + Send + Sync>,
    snapshot: Arc<dyn CacheSnapshot>,
}

/// Aggregate snapshot across every registered breaker and cache.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub breakers: HashMap<String, BreakerStats>,
    pub caches: HashMap<String, CacheStats>,
}

/// Registry of per-upstream breakers and per-namespace caches.
pub struct UpstreamRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    caches: RwLock<HashMap<(String, TypeId), CacheHandle>>,
    listeners: RwLock<Vec<StateChangeListener>>,
}

impl Default for UpstreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Get or create the breaker for `name`. The configuration only applies
    /// on creation; later callers share the existing instance.
    pub fn breaker(&self, name: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut map = self.breakers.write();
        if let Some(breaker) = map.get(name) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config.clone()));
        for listener in self.listeners.read().iter() {
            breaker.subscribe(Arc::clone(listener));
        }
        info!(upstream = %name, "created circuit breaker");
        map.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Get or create the cache for `namespace` (and value type `V`).
    pub fn cache<V: Clone + Send + Sync + 'static>(
        &self,
        namespace: &str,
        options: CacheOptions,
    ) -> Arc<ResponseCache<V>> {
        let key = (namespace.to_string(), TypeId::of::<V>());
        if let Some(handle) = self.caches.read().get(&key) {
            if let Ok(cache) = Arc::clone(&handle.any).downcast::<ResponseCache<V>>() {
                return cache;
            }
        }
        let mut map = self.caches.write();
        if let Some(handle) = map.get(&key) {
            if let Ok(cache) = Arc::clone(&handle.any).downcast::<ResponseCache<V>>() {
                return cache;
            }
        }
        let cache = ResponseCache::<V>::new(namespace, options);
        info!(namespace = %namespace, "created response cache");
        map.insert(
            key,
            CacheHandle {
                any: Arc::clone(&cache) as Arc<dyn Any + Send + Sync>,
                snapshot: Arc::clone(&cache) as Arc<dyn CacheSnapshot>,
            },
        );
        cache
    }

    /// Get-or-create the breaker for `name`, then run `op` through retry
    /// executor and breaker: retries happen inside the breaker's admission,
    /// so one logical call contributes exactly one outcome to the breaker no
    /// matter how many attempts the retry policy spends.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        options: &ExecuteOptions,
        op: F,
    ) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let breaker = self.breaker(name, &options.breaker);
        match options.retry {
            Some(policy) => breaker.execute(|| with_retry(&policy, op)).await,
            None => breaker.execute(op).await,
        }
    }

    /// [`execute`](Self::execute), with an open-circuit rejection replaced
    /// by `fallback()`.
    pub async fn execute_with_fallback<T, F, Fut, FB>(
        &self,
        name: &str,
        options: &ExecuteOptions,
        op: F,
        fallback: FB,
    ) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
        FB: FnOnce() -> T,
    {
        let breaker = self.breaker(name, &options.breaker);
        match options.retry {
            Some(policy) => {
                breaker
                    .execute_with_fallback(|| with_retry(&policy, op), fallback)
                    .await
            }
            None => breaker.execute_with_fallback(op, fallback).await,
        }
    }

    /// Subscribe to state changes of every breaker, existing and future.
    pub fn on_state_change(&self, listener: StateChangeListener) {
        for breaker in self.breakers.read().values() {
            breaker.subscribe(Arc::clone(&listener));
        }
        self.listeners.write().push(listener);
    }

    pub fn stats(&self) -> RegistryStats {
        let breakers = self
            .breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect();
        let caches = self
            .caches
            .read()
            .values()
            .map(|handle| {
                (
                    handle.snapshot.namespace().to_string(),
                    handle.snapshot.snapshot(),
                )
            })
            .collect();
        RegistryStats { breakers, caches }
    }

    /// Periodically log the aggregate stats snapshot. The task holds a weak
    /// reference and exits when the registry is dropped.
    pub fn spawn_stats_logger(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let stats = registry.stats();
                info!(
                    breakers = stats.breakers.len(),
                    caches = stats.caches.len(),
                    stats = ?stats,
                    "resilience stats snapshot"
                );
            }
        })
    }
}
