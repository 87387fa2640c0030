//! Closed error taxonomy for upstream calls.
//!
//! Every provider/storage/payment adapter in the gateway maps its transport
//! error into one of these variants before handing it to the resilience
//! layer, so retry predicates are total functions over [`ErrorKind`] instead
//! of string sniffing.

use std::time::Duration;
use thiserror::Error;

/// Error produced by (or on behalf of) a protected upstream call.
///
/// `Clone` is required so a single failed coalesced fetch can be propagated
/// to every caller that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// The call did not settle within the breaker's hard timeout.
    #[error("upstream `{upstream}` timed out after {waited:?}")]
    Timeout { upstream: String, waited: Duration },

    /// Connection dropped mid-flight (ECONNRESET and friends).
    #[error("connection to upstream `{upstream}` was reset")]
    ConnectionReset { upstream: String },

    /// Name resolution failed.
    #[error("DNS resolution failed for upstream `{upstream}`")]
    DnsFailure { upstream: String },

    /// Upstream answered with a non-success HTTP status.
    #[error("upstream `{upstream}` returned HTTP {status}")]
    Http { upstream: String, status: u16 },

    /// Upstream signalled throttling through its own rate-limit marker
    /// (as opposed to a bare 429, which maps to [`UpstreamError::Http`]).
    #[error("upstream `{upstream}` rate limited the request")]
    RateLimited {
        upstream: String,
        retry_after: Option<Duration>,
    },

    /// Rejected locally: the circuit for this upstream is open.
    #[error("circuit breaker `{name}` is open")]
    CircuitOpen { name: String },

    /// A coalesced cache fetch was abandoned before settling, so callers
    /// that joined it never received a result.
    #[error("in-flight fetch for cache key `{key}` was abandoned")]
    FetchAbandoned { key: String },
}

/// Discriminant used by retry predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    ConnectionReset,
    DnsFailure,
    Http(u16),
    RateLimited,
    CircuitOpen,
    FetchAbandoned,
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectionReset { .. } => ErrorKind::ConnectionReset,
            Self::DnsFailure { .. } => ErrorKind::DnsFailure,
            Self::Http { status, .. } => ErrorKind::Http(*status),
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::FetchAbandoned { .. } => ErrorKind::FetchAbandoned,
        }
    }

    /// Name of the upstream this error originated from, when known.
    pub fn upstream(&self) -> Option<&str> {
        match self {
            Self::Timeout { upstream, .. }
            | Self::ConnectionReset { upstream }
            | Self::DnsFailure { upstream }
            | Self::Http { upstream, .. }
            | Self::RateLimited { upstream, .. } => Some(upstream),
            Self::CircuitOpen { name } => Some(name),
            Self::FetchAbandoned { .. } => None,
        }
    }
}
