//! Named retry predicates, one per class of upstream.
//!
//! The gateway configures which predicate protects which upstream; the
//! resilience layer only evaluates them. All predicates are total over
//! [`ErrorKind`], so classification never depends on error message contents.

use crate::error::{ErrorKind, UpstreamError};
use crate::retry::RetryPredicate;

/// Baseline classification: connection resets, timeouts, DNS failures,
/// explicit rate limiting, and HTTP 408/429/5xx are transient. Any other
/// 4xx is a client error and is never retried. Local rejections
/// (circuit open, abandoned fetch) are never retried either.
pub fn default_retriable(err: &UpstreamError) -> bool {
    match err.kind() {
        ErrorKind::Timeout | ErrorKind::ConnectionReset | ErrorKind::DnsFailure => true,
        ErrorKind::RateLimited => true,
        ErrorKind::Http(status) => status == 408 || status == 429 || (500..=599).contains(&status),
        ErrorKind::CircuitOpen | ErrorKind::FetchAbandoned => false,
    }
}

/// Object storage: idempotent puts/gets, so everything transient is fair
/// game, including gateway-level 503s during bucket failover.
pub fn storage(err: &UpstreamError) -> bool {
    default_retriable(err)
}

/// Payment API: a timed-out charge may still have been committed, so only
/// failures that provably happened before the request reached the provider
/// are replayed.
pub fn payment(err: &UpstreamError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset | ErrorKind::DnsFailure
    )
}

/// Image generation providers throttle aggressively; treat their rate-limit
/// markers and capacity 503s as transient on top of the baseline.
pub fn image_provider(err: &UpstreamError) -> bool {
    default_retriable(err)
}

/// Video generation runs long jobs; a timeout usually means the job is still
/// rendering, so re-submitting would double the work.
pub fn video_provider(err: &UpstreamError) -> bool {
    match err.kind() {
        ErrorKind::Timeout => false,
        _ => default_retriable(err),
    }
}

/// Text generation providers, same shape as image providers.
pub fn text_provider(err: &UpstreamError) -> bool {
    default_retriable(err)
}

/// Email transport: queued delivery, safe to retry anything transient.
pub fn email(err: &UpstreamError) -> bool {
    default_retriable(err)
}

/// Look up the predicate for a named upstream. Unknown names get the
/// baseline classification.
pub fn for_upstream(name: &str) -> RetryPredicate {
    match name {
        "storage" => storage,
        "payment" => payment,
        "image-provider" => image_provider,
        "video-provider" => video_provider,
        "text-provider" => text_provider,
        "email" => email,
        _ => default_retriable,
    }
}
