//! Error types for modelgate
//!
//! Every failure the orchestration core can produce is a `GatewayError`.
//! The `ErrorClass` accessor drives retry and circuit breaker decisions:
//! only transient errors count against provider health, everything else
//! propagates without touching breaker or router state.

use crate::breaker::CircuitState;
use thiserror::Error;

/// Closed classification of gateway errors
///
/// Replaces open-ended exception-type matching: the breaker and the retry
/// handler only ever consult this two-valued class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying: timeouts, 5xx, connection failures, upstream 429s
    Transient,
    /// Not worth retrying: validation errors, auth failures, local decisions
    Fatal,
}

/// Main error type for the orchestration core
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transient failure from provider {provider}: {reason}")]
    ProviderTransient { provider: String, reason: String },

    #[error("Provider {provider} rate limited the request: {reason}")]
    UpstreamRateLimited { provider: String, reason: String },

    #[error("Permanent failure from provider {provider}: {reason}")]
    ProviderFatal { provider: String, reason: String },

    #[error(
        "Service temporarily unavailable for provider {provider} \
        (circuit {state:?} after {failures} failures)"
    )]
    CircuitOpen {
        provider: String,
        state: CircuitState,
        failures: u32,
    },

    #[error("Rate limit exceeded for tenant {tenant} on {endpoint}")]
    RateLimited { tenant: String, endpoint: String },

    #[error("No healthy provider available: {0}")]
    NoHealthyProvider(String),

    #[error("All providers failed: primary {primary} and secondary {secondary}: {reason}")]
    AllProvidersFailed {
        primary: String,
        secondary: String,
        reason: String,
    },

    #[error("Request deadline exceeded after {elapsed_ms} ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Classify this error for retry and breaker bookkeeping
    ///
    /// Upstream rate limits are transient: they follow the same backoff
    /// path as timeouts and 5xx responses. The gateway's own tenant rate
    /// limit (`RateLimited`) is a local admission decision and is fatal.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ProviderTransient { .. } | Self::UpstreamRateLimited { .. } => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether the retry handler may attempt this operation again
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Provider this error originated from, if any
    ///
    /// Used by callers to decide on user-facing messaging without parsing
    /// the display string.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::ProviderTransient { provider, .. }
            | Self::UpstreamRateLimited { provider, .. }
            | Self::ProviderFatal { provider, .. }
            | Self::CircuitOpen { provider, .. } => Some(provider),
            _ => None,
        }
    }
}

/// Convenience type alias for Results
pub type GatewayResult<T> = Result<T, GatewayError>;
