/// Resilience control plane demo - brokering a flaky generation provider.
///
/// Run with: cargo run --example provider_pipeline
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use relay_resilience::{
    BreakerConfig, CacheOptions, ExecuteOptions, RetryPolicy, StateChange, UpstreamError,
    UpstreamRegistry,
};

#[tokio::main]
async fn main() {
    println!("=== Relay resilience demo ===\n");

    let registry = Arc::new(UpstreamRegistry::new());
    registry.on_state_change(Arc::new(|change: &StateChange| {
        println!(
            "  [event] breaker `{}` {:?} -> {:?}",
            change.name, change.from, change.to
        );
    }));

    demo_breaker_lifecycle(&registry).await;
    demo_cache_stampede(&registry).await;

    println!("\n=== Final stats ===");
    match serde_json::to_string_pretty(&registry.stats()) {
        Ok(json) => println!("{json}"),
        Err(err) => println!("failed to serialize stats: {err}"),
    }
}

async fn demo_breaker_lifecycle(registry: &Arc<UpstreamRegistry>) {
    println!("--- Circuit breaker lifecycle ---");

    let options = ExecuteOptions {
        breaker: BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(400),
            ..Default::default()
        },
        retry: Some(
            RetryPolicy::for_upstream("image-provider")
                .with_max_retries(1)
                .with_delays(Duration::from_millis(10), Duration::from_millis(50)),
        ),
    };

    // Provider is down for a while, then recovers.
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = |calls: Arc<AtomicUsize>| async move {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        sleep(Duration::from_millis(5)).await;
        if call <= 8 {
            Err(UpstreamError::Http {
                upstream: "image-provider".into(),
                status: 503,
            })
        } else {
            Ok(format!("https://cdn.relay.dev/render/{call}.png"))
        }
    };

    for i in 0..6 {
        let calls = Arc::clone(&calls);
        let res = registry
            .execute_with_fallback(
                "image-provider",
                &options,
                move || provider(Arc::clone(&calls)),
                || "https://cdn.relay.dev/placeholder.png".to_string(),
            )
            .await;
        match res {
            Ok(url) => println!("  request {i}: {url}"),
            Err(err) => println!("  request {i}: failed: {err}"),
        }
        sleep(Duration::from_millis(50)).await;
    }

    println!("  waiting for reset timeout...");
    sleep(Duration::from_millis(400)).await;

    for i in 6..9 {
        let calls = Arc::clone(&calls);
        let res = registry
            .execute("image-provider", &options, move || {
                provider(Arc::clone(&calls))
            })
            .await;
        match res {
            Ok(url) => println!("  request {i}: {url}"),
            Err(err) => println!("  request {i}: failed: {err}"),
        }
    }
    println!("  provider calls made: {}\n", calls.load(Ordering::SeqCst));
}

async fn demo_cache_stampede(registry: &Arc<UpstreamRegistry>) {
    println!("--- Cache stampede protection ---");

    let cache = registry.cache::<String>(
        "images",
        CacheOptions {
            ttl: Duration::from_secs(30),
            ..Default::default()
        },
    );
    let fetches = Arc::new(AtomicUsize::new(0));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..25 {
        let cache = Arc::clone(&cache);
        let fetches = Arc::clone(&fetches);
        tasks.spawn(async move {
            cache
                .get_or_fetch("hero-banner", move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(80)).await;
                    Ok("s3://relay-media/hero-banner.png".to_string())
                })
                .await
        });
    }

    let mut served = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined.expect("task panicked").is_ok() {
            served += 1;
        }
    }

    println!("  concurrent callers: 25");
    println!("  served: {served}");
    println!("  upstream fetches: {}", fetches.load(Ordering::SeqCst));
}
