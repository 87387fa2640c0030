//! Resilience control plane for the Relay gateway.
//!
//! Every call to an external upstream (generation providers, object storage,
//! email transport, payment API) goes through this crate:
//!
//! 1. [`ResponseCache`] deduplicates idempotent reads with TTL and per-key
//!    fetch coalescing (stampede protection).
//! 2. [`CircuitBreaker`] gates whether the upstream is called at all, one
//!    breaker per upstream name.
//! 3. [`with_retry`] runs the underlying call with bounded, jittered
//!    exponential backoff, gated by a per-upstream [`predicates`] classifier.
//!
//! [`UpstreamRegistry`] owns the breaker/cache instances and is passed
//! explicitly from the service root; there are no process globals. All state
//! is in-memory and resets on restart.
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_resilience::{ExecuteOptions, UpstreamError, UpstreamRegistry};
//!
//! # async fn demo() -> Result<(), UpstreamError> {
//! let registry = Arc::new(UpstreamRegistry::new());
//! let options = ExecuteOptions::for_upstream("image-provider");
//! let url: String = registry
//!     .execute("image-provider", &options, || async {
//!         // the provider adapter's HTTP call goes here
//!         Ok::<_, UpstreamError>("https://cdn.example/render/1.png".to_string())
//!     })
//!     .await?;
//! # let _ = url;
//! # Ok(()) }
//! ```

pub mod backoff;
pub mod breaker;
pub mod cache;
pub mod error;
pub mod predicates;
pub mod registry;
pub mod retry;

pub use breaker::{
    BreakerConfig, BreakerStats, CircuitBreaker, CircuitState, StateChange, StateChangeListener,
};
pub use cache::{CacheOptions, CacheStats, ResponseCache};
pub use error::{ErrorKind, UpstreamError};
pub use registry::{ExecuteOptions, RegistryStats, UpstreamRegistry};
pub use retry::{with_retry, with_retry_observed, RetryPolicy, RetryPredicate};
