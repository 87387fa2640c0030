//! Namespaced TTL cache with per-key fetch coalescing.
//!
//! `get_or_fetch` guarantees that for any key at most one fetcher invocation
//! is in flight across all concurrent callers: the first caller to miss
//! installs an in-flight handle in the same lock acquisition as the miss
//! check (before any await), and everyone else joins that handle and receives
//! the leader's result, errors included. In-flight handles have a bounded
//! lifetime so a fetch that never settles cannot lock a key out permanently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Future;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout};
use tracing::debug;

use crate::error::UpstreamError;

/// Per-namespace cache configuration.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Default TTL for stored values.
    pub ttl: Duration,
    /// Upper bound on stored entries; oldest resolved entry is evicted on
    /// insert when exceeded. `None` disables the bound.
    pub max_keys: Option<usize>,
    /// How often the background sweep removes expired entries.
    pub check_period: Duration,
    /// How long an in-flight fetch may be joined before new callers bypass
    /// it and waiting callers give up.
    pub inflight_ttl: Duration,
    /// Keys longer than this are replaced by a prefix + sha256 digest to
    /// bound memory.
    pub max_key_len: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_keys: None,
            check_period: Duration::from_secs(60),
            inflight_ttl: Duration::from_secs(30),
            max_key_len: 200,
        }
    }
}

/// Hit/miss accounting snapshot. A coalesced join counts as a hit at join
/// time, before the leader settles, so joins that end in the leader's error
/// are hits too: the counters track avoided fetch attempts, not successful
/// reads.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub keys: usize,
}

enum Slot<V> {
    Ready {
        value: V,
        expires_at: Instant,
        inserted_at: Instant,
    },
    Pending {
        tx: broadcast::Sender<Result<V, UpstreamError>>,
        started_at: Instant,
        token: u64,
    },
}

enum Claim<V> {
    Join {
        rx: broadcast::Receiver<Result<V, UpstreamError>>,
        budget: Duration,
    },
    Lead {
        tx: broadcast::Sender<Result<V, UpstreamError>>,
        token: u64,
    },
}

/// Deduplicating result cache for one namespace.
///
/// Values are opaque to the cache; `Clone` is required to hand the same
/// result to every coalesced caller.
pub struct ResponseCache<V> {
    namespace: String,
    options: CacheOptions,
    entries: Arc<Mutex<HashMap<String, Slot<V>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    token_seq: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> ResponseCache<V> {
    /// Create the cache and spawn its TTL sweeper. Must be called from
    /// within a tokio runtime. The sweeper holds only a weak reference and
    /// exits once the cache is dropped.
    pub fn new(namespace: impl Into<String>, options: CacheOptions) -> Arc<Self> {
        let cache = Arc::new(Self {
            namespace: namespace.into(),
            options,
            entries: Arc::new(Mutex::new(HashMap::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            token_seq: AtomicU64::new(0),
        });
        Self::spawn_sweeper(&cache);
        cache
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fetch-through read with the namespace default TTL.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<V, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, UpstreamError>>,
    {
        self.get_or_fetch_with_ttl(key, fetcher, self.options.ttl)
            .await
    }

    /// Fetch-through read with a per-call TTL override.
    ///
    /// Hit: return the live value. Live in-flight fetch: join it and return
    /// its eventual result without invoking `fetcher`. Miss: become the
    /// leader, run `fetcher`, store on success, and broadcast the outcome
    /// (success or failure) to every joined caller.
    pub async fn get_or_fetch_with_ttl<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Duration,
    ) -> Result<V, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, UpstreamError>>,
    {
        let key = self.full_key(key);

        // Miss detection and in-flight installation happen under one lock
        // acquisition, before the first await: a concurrent caller can never
        // slip between the check and the set.
        let claim = {
            let mut map = self.entries.lock();
            let now = Instant::now();
            match map.get(&key) {
                Some(Slot::Ready {
                    value, expires_at, ..
                }) if *expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value.clone());
                }
                Some(Slot::Pending { tx, started_at, .. })
                    if now.duration_since(*started_at) <= self.options.inflight_ttl =>
                {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    // Wait only for what remains of the leader's budget, so
                    // a key is never observed pending longer than
                    // inflight_ttl overall.
                    let budget = self.options.inflight_ttl - now.duration_since(*started_at);
                    Claim::Join {
                        rx: tx.subscribe(),
                        budget,
                    }
                }
                _ => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let (tx, _) = broadcast::channel(1);
                    let token = self.token_seq.fetch_add(1, Ordering::Relaxed);
                    map.insert(
                        key.clone(),
                        Slot::Pending {
                            tx: tx.clone(),
                            started_at: now,
                            token,
                        },
                    );
                    Claim::Lead { tx, token }
                }
            }
        };

        match claim {
            Claim::Join { mut rx, budget } => {
                match timeout(budget, rx.recv()).await {
                    Ok(Ok(result)) => result,
                    // Leader dropped without settling, or it outlived the
                    // in-flight budget.
                    Ok(Err(_)) | Err(_) => Err(UpstreamError::FetchAbandoned { key }),
                }
            }
            Claim::Lead { tx, token } => {
                let result = fetcher().await;
                {
                    let mut map = self.entries.lock();
                    let now = Instant::now();
                    // Settle only our own handle. If the sweeper dropped it
                    // or a newer fetch replaced it while we were suspended,
                    // the newer state wins and our result is only broadcast.
                    let ours = matches!(
                        map.get(&key),
                        Some(Slot::Pending { token: t, .. }) if *t == token
                    );
                    if ours {
                        match &result {
                            Ok(value) => {
                                map.insert(
                                    key.clone(),
                                    Slot::Ready {
                                        value: value.clone(),
                                        expires_at: now + ttl,
                                        inserted_at: now,
                                    },
                                );
                                self.enforce_max_keys(&mut map, &key);
                            }
                            Err(_) => {
                                map.remove(&key);
                            }
                        }
                    }
                }
                // Errors propagate to every caller that joined this fetch.
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    /// Drop a key. Returns whether an entry (resolved or pending) existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let key = self.full_key(key);
        self.entries.lock().remove(&key).is_some()
    }

    /// Drop every entry in the namespace.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            keys: self.entries.lock().len(),
        }
    }

    /// Namespace prefix makes cross-namespace collisions impossible;
    /// oversized keys are digested to bound memory.
    fn full_key(&self, key: &str) -> String {
        if key.len() <= self.options.max_key_len {
            format!("{}:{}", self.namespace, key)
        } else {
            let digest = hex::encode(Sha256::digest(key.as_bytes()));
            let prefix: String = key.chars().take(16).collect();
            format!("{}:{}#{}", self.namespace, prefix, digest)
        }
    }

    fn enforce_max_keys(&self, map: &mut HashMap<String, Slot<V>>, just_inserted: &str) {
        let Some(max) = self.options.max_keys else {
            return;
        };
        while map.len() > max {
            let oldest = map
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready { inserted_at, .. } if k != just_inserted => {
                        Some((k.clone(), *inserted_at))
                    }
                    _ => None,
                })
                .min_by_key(|(_, at)| *at)
                .map(|(k, _)| k);
            match oldest {
                Some(k) => {
                    map.remove(&k);
                    debug!(namespace = %self.namespace, key = %k, "evicted oldest cache entry");
                }
                None => break,
            }
        }
    }

    fn spawn_sweeper(cache: &Arc<Self>) {
        let entries = Arc::downgrade(&cache.entries);
        let namespace = cache.namespace.clone();
        let period = cache.options.check_period;
        let inflight_ttl = cache.options.inflight_ttl;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let now = Instant::now();
                let mut map = entries.lock();
                let before = map.len();
                map.retain(|_, slot| match slot {
                    Slot::Ready { expires_at, .. } => *expires_at > now,
                    Slot::Pending { started_at, .. } => {
                        now.duration_since(*started_at) <= inflight_ttl
                    }
                });
                let removed = before - map.len();
                if removed > 0 {
                    debug!(namespace = %namespace, removed, "swept expired cache entries");
                }
            }
        });
    }
}

/// Type-erased stats access so the registry can aggregate caches of
/// different value types.
pub(crate) trait CacheSnapshot: Send + Sync {
    fn namespace(&self) -> &str;
    fn snapshot(&self) -> CacheStats;
}

impl<V: Clone + Send + Sync + 'static> CacheSnapshot for ResponseCache<V> {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn snapshot(&self) -> CacheStats {
        self.stats()
    }
}
