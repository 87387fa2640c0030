//! Per-upstream circuit breaker.
//!
//! One breaker guards one named upstream. It tracks a sliding window of call
//! outcomes and flips between three states:
//!
//! ```text
//! Closed → Open:      failure_count >= failure_threshold, or the windowed
//!                     error rate crosses error_threshold_pct once the window
//!                     holds at least volume_threshold calls
//! Open → HalfOpen:    first call arriving at/after next_attempt_at
//! HalfOpen → Closed:  success_threshold successes since the transition
//! HalfOpen → Open:    any single failure
//! ```
//!
//! While HALF_OPEN, every concurrent trial call is admitted and their results
//! are evaluated in aggregate; a single failure among them reopens the
//! circuit. Every call runs under the breaker's hard `call_timeout`; a call
//! that does not settle in time counts as a failure even if it resolves
//! later.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Future;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED that trip the circuit.
    pub failure_threshold: u32,
    /// Successes in HALF_OPEN required to close the circuit again.
    pub success_threshold: u32,
    /// Hard timeout applied to every wrapped call.
    pub call_timeout: Duration,
    /// How long an opened circuit rejects before admitting a trial call.
    pub reset_timeout: Duration,
    /// Width of the sliding outcome window.
    pub monitoring_period: Duration,
    /// Minimum window volume before the error-rate rule applies.
    pub volume_threshold: u32,
    /// Windowed error rate (percent) that trips the circuit.
    pub error_threshold_pct: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            volume_threshold: 10,
            error_threshold_pct: 50.0,
        }
    }
}

/// Emitted on every state transition, for external logging/alerting.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Subscriber invoked synchronously on each transition.
pub type StateChangeListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Point-in-time snapshot for the stats collector.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub rejections: u64,
    pub window_volume: usize,
    pub error_rate_pct: f64,
}

struct Inner {
    state: CircuitState,
    /// Counters since the last transition.
    failure_count: u32,
    success_count: u32,
    /// Sliding window of (timestamp, success), pruned to monitoring_period.
    history: VecDeque<(Instant, bool)>,
    state_changed_at: Instant,
    /// Set while OPEN; absent otherwise.
    next_attempt_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    rejections: u64,
}

/// Circuit breaker protecting one named upstream.
///
/// Created lazily by [`crate::UpstreamRegistry`] and shared for process
/// lifetime; only the breaker's own execution path mutates its state.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    listeners: RwLock<Vec<StateChangeListener>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                history: VecDeque::new(),
                state_changed_at: Instant::now(),
                next_attempt_at: None,
                total_failures: 0,
                total_successes: 0,
                rejections: 0,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a transition subscriber. Listeners run synchronously on the
    /// calling task, so keep them cheap.
    pub fn subscribe(&self, listener: StateChangeListener) {
        self.listeners.write().push(listener);
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected immediately with [`UpstreamError::CircuitOpen`] while OPEN
    /// (unless `reset_timeout` has elapsed, in which case this call becomes a
    /// HALF_OPEN trial). The call races the configured `call_timeout`; on
    /// timeout the operation is abandoned and a failure is recorded.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.before_call()?;

        let result = match timeout(self.config.call_timeout, op()).await {
            Ok(settled) => settled,
            Err(_) => Err(UpstreamError::Timeout {
                upstream: self.name.clone(),
                waited: self.config.call_timeout,
            }),
        };

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// [`execute`](Self::execute), but an open-circuit rejection is replaced
    /// by `fallback()`. Operation errors still propagate: the fallback is an
    /// explicit substitute for "we did not even try", nothing else.
    pub async fn execute_with_fallback<T, F, Fut, FB>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
        FB: FnOnce() -> T,
    {
        match self.execute(op).await {
            Err(UpstreamError::CircuitOpen { name }) => {
                debug!(breaker = %name, "circuit open, serving fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        Self::prune(&mut inner, now, self.config.monitoring_period);
        BreakerStats {
            state: inner.state,
            failures: inner.total_failures,
            successes: inner.total_successes,
            rejections: inner.rejections,
            window_volume: inner.history.len(),
            error_rate_pct: Self::error_rate(&inner),
        }
    }

    fn before_call(&self) -> Result<(), UpstreamError> {
        let change = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            match inner.state {
                // Every concurrent HALF_OPEN trial is admitted; one failure
                // among them reopens the circuit.
                CircuitState::Closed | CircuitState::HalfOpen => None,
                CircuitState::Open => {
                    let due = inner.next_attempt_at.map_or(true, |at| now >= at);
                    if !due {
                        inner.rejections += 1;
                        return Err(UpstreamError::CircuitOpen {
                            name: self.name.clone(),
                        });
                    }
                    Some(self.transition(&mut inner, CircuitState::HalfOpen, now))
                }
            }
        };
        if let Some(change) = change {
            self.emit(&change);
        }
        Ok(())
    }

    fn record_success(&self) {
        let change = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            Self::prune(&mut inner, now, self.config.monitoring_period);
            inner.history.push_back((now, true));
            inner.total_successes += 1;
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        Some(self.transition(&mut inner, CircuitState::Closed, now))
                    } else {
                        None
                    }
                }
                // Late result from an abandoned call; the window records it
                // but no transition happens while OPEN.
                CircuitState::Open => None,
            }
        };
        if let Some(change) = change {
            self.emit(&change);
        }
    }

    fn record_failure(&self) {
        let change = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            Self::prune(&mut inner, now, self.config.monitoring_period);
            inner.history.push_back((now, false));
            inner.total_failures += 1;
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count += 1;
                    let volume = inner.history.len() as u32;
                    let tripped = inner.failure_count >= self.config.failure_threshold
                        || (volume >= self.config.volume_threshold
                            && Self::error_rate(&inner) >= self.config.error_threshold_pct);
                    if tripped {
                        Some(self.transition(&mut inner, CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                // 1-strike policy: a single HALF_OPEN failure reopens.
                CircuitState::HalfOpen => {
                    Some(self.transition(&mut inner, CircuitState::Open, now))
                }
                CircuitState::Open => None,
            }
        };
        if let Some(change) = change {
            self.emit(&change);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) -> StateChange {
        let from = inner.state;
        inner.state = to;
        inner.state_changed_at = now;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt_at = match to {
            CircuitState::Open => Some(now + self.config.reset_timeout),
            _ => None,
        };
        StateChange {
            name: self.name.clone(),
            from,
            to,
        }
    }

    fn emit(&self, change: &StateChange) {
        match change.to {
            CircuitState::Open => {
                warn!(breaker = %change.name, from = ?change.from, "circuit opened")
            }
            CircuitState::HalfOpen => {
                info!(breaker = %change.name, "circuit half-open, admitting trial calls")
            }
            CircuitState::Closed => {
                info!(breaker = %change.name, "circuit closed")
            }
        }
        for listener in self.listeners.read().iter() {
            listener(change);
        }
    }

    fn prune(inner: &mut Inner, now: Instant, window: Duration) {
        while let Some(&(at, _)) = inner.history.front() {
            if now.duration_since(at) > window {
                inner.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(inner: &Inner) -> f64 {
        let volume = inner.history.len();
        if volume == 0 {
            return 0.0;
        }
        let failures = inner.history.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / volume as f64 * 100.0
    }
}
