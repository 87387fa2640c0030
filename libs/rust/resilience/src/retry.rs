//! Bounded retry executor with jittered exponential backoff.
//!
//! Retries are always sequential. Whether a failure is worth retrying is
//! decided by the policy's predicate (see [`crate::predicates`]), never by
//! the executor itself.

use std::time::Duration;

use futures::Future;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backoff;
use crate::error::UpstreamError;
use crate::predicates;

/// Total classifier deciding whether a failed attempt may be retried.
pub type RetryPredicate = fn(&UpstreamError) -> bool;

/// Per-call-site retry policy. A plain value: cheap to copy, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt, so the operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub predicate: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            predicate: predicates::default_retriable,
        }
    }
}

impl RetryPolicy {
    /// Default policy with the named upstream's retry predicate plugged in.
    pub fn for_upstream(name: &str) -> Self {
        Self {
            predicate: predicates::for_upstream(name),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Run `op`, retrying per `policy` until it succeeds, the predicate rejects
/// the error, or `max_retries` is exhausted. The last observed error is
/// returned on exhaustion.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    with_retry_observed(policy, |_, _| {}, op).await
}

/// [`with_retry`] with an attempt observer.
///
/// `on_retry(error, next_attempt)` fires before each backoff sleep, once per
/// retry actually taken. It is a side channel for logging/metrics and has no
/// influence on control flow.
pub async fn with_retry_observed<T, F, Fut, O>(
    policy: &RetryPolicy,
    mut on_retry: O,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
    O: FnMut(&UpstreamError, u32),
{
    let mut attempt: u32 = 0;
    let mut history: Vec<String> = Vec::new();

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "operation recovered after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                history.push(format!("attempt {}: {}", attempt + 1, err));

                if !(policy.predicate)(&err) {
                    debug!(error = %err, "error not retriable, propagating");
                    return Err(err);
                }
                if attempt >= policy.max_retries {
                    warn!(
                        attempts = attempt + 1,
                        history = ?history,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(err);
                }

                let delay = backoff::delay_for_attempt(attempt, policy);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                on_retry(&err, attempt + 1);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
