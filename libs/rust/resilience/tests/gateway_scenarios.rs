/// Integration tests for the resilience control plane in gateway scenarios.
///
/// Covers:
/// 1. Cache stampede prevention under heavy concurrency
/// 2. Error propagation to every coalesced caller
/// 3. End-to-end breaker lifecycle for a failing generation provider
/// 4. Cache in front of breaker + retry for idempotent reads
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::sleep;

use relay_resilience::{
    BreakerConfig, CacheOptions, CircuitState, ExecuteOptions, ResponseCache, RetryPolicy,
    UpstreamError, UpstreamRegistry,
};

/// Simulated upstream that fails a configurable number of leading calls.
struct FlakyProvider {
    fail_first: usize,
    calls: AtomicUsize,
}

impl FlakyProvider {
    fn new(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            calls: AtomicUsize::new(0),
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    async fn render(&self) -> Result<String, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        sleep(Duration::from_millis(2)).await;
        if call <= self.fail_first {
            Err(UpstreamError::Http {
                upstream: "image-provider".into(),
                status: 503,
            })
        } else {
            Ok(format!("render-{call}"))
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn stampede_of_fifty_callers_triggers_exactly_one_fetch() {
    let cache: Arc<ResponseCache<String>> = ResponseCache::new(
        "images",
        CacheOptions {
            ttl: Duration::from_secs(60),
            ..Default::default()
        },
    );
    let fetches = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let cache = Arc::clone(&cache);
        let fetches = Arc::clone(&fetches);
        tasks.spawn(async move {
            cache
                .get_or_fetch("hero-image", move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    // Slow fetch so the other callers pile up behind it.
                    sleep(Duration::from_millis(50)).await;
                    Ok("s3://relay-media/hero.png".to_string())
                })
                .await
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.expect("task panicked").expect("fetch failed"));
    }

    println!("Stampede test:");
    println!("  Callers: {}", results.len());
    println!("  Fetcher invocations: {}", fetches.load(Ordering::SeqCst));

    assert_eq!(results.len(), 50);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(results
        .iter()
        .all(|value| value == "s3://relay-media/hero.png"));

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 49);
}

#[tokio::test]
async fn coalesced_fetch_failure_reaches_every_caller() {
    let cache: Arc<ResponseCache<String>> =
        ResponseCache::new("images", CacheOptions::default());
    let fetches = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let cache = Arc::clone(&cache);
        let fetches = Arc::clone(&fetches);
        tasks.spawn(async move {
            cache
                .get_or_fetch("broken", move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(30)).await;
                    Err::<String, _>(UpstreamError::ConnectionReset {
                        upstream: "storage".into(),
                    })
                })
                .await
        });
    }

    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        assert!(joined.expect("task panicked").is_err());
        failures += 1;
    }

    assert_eq!(failures, 20);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    let stats = cache.stats();
    // Failed fetches leave no entry behind.
    assert_eq!(stats.keys, 0);
    // Joins count as hits at join time even when the shared fetch fails:
    // the counters track avoided fetch attempts, not successful reads.
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 19);
}

fn image_provider_options() -> ExecuteOptions {
    ExecuteOptions {
        breaker: BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            call_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_millis(150),
            monitoring_period: Duration::from_secs(10),
            volume_threshold: 100,
            error_threshold_pct: 100.0,
        },
        retry: Some(
            RetryPolicy::for_upstream("image-provider")
                .with_max_retries(3)
                .with_delays(Duration::from_millis(1), Duration::from_millis(5))
                .without_jitter(),
        ),
    }
}

#[tokio::test]
async fn failing_image_provider_opens_circuit_then_recovers() {
    let registry = Arc::new(UpstreamRegistry::new());
    let options = image_provider_options();
    let provider = FlakyProvider::always_failing();

    // Three logical calls, each exhausting its retries, each counted once by
    // the breaker.
    for call in 0..3 {
        let provider = Arc::clone(&provider);
        let res: Result<String, _> = registry
            .execute("image-provider", &options, move || {
                let provider = Arc::clone(&provider);
                async move { provider.render().await }
            })
            .await;
        assert!(res.is_err(), "call {call} should fail");
    }

    let stats = registry.stats();
    println!("After 3 exhausted calls: {:?}", stats.breakers["image-provider"]);
    // 3 logical calls x (1 attempt + 3 retries).
    assert_eq!(provider.calls(), 12);
    assert_eq!(stats.breakers["image-provider"].failures, 3);
    assert_eq!(stats.breakers["image-provider"].state, CircuitState::Open);

    // While open: immediate rejection, the provider is not touched, and a
    // fallback is served when configured.
    let before = provider.calls();
    let rejected_provider = Arc::clone(&provider);
    let res: Result<String, _> = registry
        .execute("image-provider", &options, move || {
            let provider = Arc::clone(&rejected_provider);
            async move { provider.render().await }
        })
        .await;
    assert!(matches!(res, Err(UpstreamError::CircuitOpen { .. })));
    assert_eq!(provider.calls(), before);

    let fallback_provider = Arc::clone(&provider);
    let res = registry
        .execute_with_fallback(
            "image-provider",
            &options,
            move || {
                let provider = Arc::clone(&fallback_provider);
                async move { provider.render().await }
            },
            || "placeholder.png".to_string(),
        )
        .await;
    assert_eq!(res.unwrap(), "placeholder.png");
    assert_eq!(provider.calls(), before);

    // After the reset timeout the provider has recovered; two successful
    // trial calls close the circuit.
    sleep(Duration::from_millis(200)).await;
    let recovered = FlakyProvider::new(0);
    for _ in 0..2 {
        let provider = Arc::clone(&recovered);
        let res: Result<String, _> = registry
            .execute("image-provider", &options, move || {
                let provider = Arc::clone(&provider);
                async move { provider.render().await }
            })
            .await;
        assert!(res.is_ok());
    }
    let stats = registry.stats();
    println!("After recovery: {:?}", stats.breakers["image-provider"]);
    assert_eq!(stats.breakers["image-provider"].state, CircuitState::Closed);
}

#[tokio::test]
async fn transient_provider_errors_are_absorbed_by_retries() {
    let registry = Arc::new(UpstreamRegistry::new());
    let options = image_provider_options();
    let provider = FlakyProvider::new(2);

    let run = Arc::clone(&provider);
    let res: Result<String, _> = registry
        .execute("image-provider", &options, move || {
            let provider = Arc::clone(&run);
            async move { provider.render().await }
        })
        .await;

    assert_eq!(res.unwrap(), "render-3");
    assert_eq!(provider.calls(), 3);
    let stats = registry.stats();
    assert_eq!(stats.breakers["image-provider"].failures, 0);
    assert_eq!(stats.breakers["image-provider"].successes, 1);
}

#[tokio::test]
async fn cached_reads_bypass_breaker_and_provider() {
    let registry = Arc::new(UpstreamRegistry::new());
    let options = image_provider_options();
    let cache = registry.cache::<String>(
        "images",
        CacheOptions {
            ttl: Duration::from_secs(60),
            ..Default::default()
        },
    );
    let provider = FlakyProvider::new(0);

    for _ in 0..5 {
        let registry = Arc::clone(&registry);
        let provider = Arc::clone(&provider);
        let options = options.clone();
        let value = cache
            .get_or_fetch("thumbnail:42", move || async move {
                registry
                    .execute("image-provider", &options, move || {
                        let provider = Arc::clone(&provider);
                        async move { provider.render().await }
                    })
                    .await
            })
            .await
            .unwrap();
        assert_eq!(value, "render-1");
    }

    // One upstream call total; four cache hits.
    assert_eq!(provider.calls(), 1);
    let stats = registry.stats();
    assert_eq!(stats.caches["images"].hits, 4);
    assert_eq!(stats.caches["images"].misses, 1);
    assert_eq!(stats.breakers["image-provider"].successes, 1);
}
