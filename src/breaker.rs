//! Circuit breaker for provider call paths
//!
//! Admission-control state machine that stops calling a failing provider
//! until it is likely recovered. One breaker protects one call path,
//! typically one upstream provider.
//!
//! State transitions:
//! - CLOSED  --(failure_count >= failure_threshold)--> OPEN
//! - OPEN    --(recovery_timeout since last failure)--> HALF_OPEN
//!   (checked lazily on admission, no background timer)
//! - HALF_OPEN --(half_open_max_calls successes)--> CLOSED
//! - HALF_OPEN --(any failure)--> OPEN

use crate::error::{ErrorClass, GatewayError, GatewayResult};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit state for a protected call path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, failures accumulate
    Closed,
    /// Tripped, requests are rejected until the recovery timeout elapses
    Open,
    /// Probing recovery with a bounded number of calls
    HalfOpen,
}

impl CircuitState {
    /// Label for logging and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the circuit trips
    pub failure_threshold: u32,
    /// How long an OPEN circuit waits before admitting probes
    pub recovery_timeout: Duration,
    /// Probes admitted while HALF_OPEN; the same count of consecutive
    /// successes closes the circuit
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

/// Snapshot of breaker counters for observability
///
/// Produced by [`CircuitBreaker::stats`] and consumed by the metrics sink.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub blocked_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Probes admitted (in flight or resolved) during the current
    /// HALF_OPEN episode. Incremented exactly once per admission.
    half_open_calls: u32,
    last_failure_time: Option<Instant>,
    total_calls: u64,
    blocked_calls: u64,
}

/// Failure-aware gate for one provider call path
///
/// The lock covers only state inspection and transitions; the wrapped
/// operation always executes outside the lock so traffic through a healthy
/// provider is never serialized.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for the named call path
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure_time: None,
                total_calls: 0,
                blocked_calls: 0,
            }),
        }
    }

    /// Name of the protected call path
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check admission, performing the lazy OPEN -> HALF_OPEN transition
    ///
    /// Counts the call: `total_calls` always, `blocked_calls` on rejection.
    /// In HALF_OPEN the admission itself increments `half_open_calls`, so
    /// at most `half_open_max_calls` probes are ever in flight.
    pub fn should_allow_request(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.total_calls += 1;

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_time
                    .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    tracing::info!(
                        breaker = %self.name,
                        "Circuit half-open, admitting probe requests"
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_calls = 1;
                    true
                } else {
                    inner.blocked_calls += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    // Probe budget exhausted; block until an outcome resolves
                    inner.blocked_calls += 1;
                    false
                }
            }
        }
    }

    /// Whether the circuit currently rejects traffic
    ///
    /// Performs the same lazy recovery check as admission but does not
    /// count a call or consume a probe slot.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::Open {
            let recovered = inner
                .last_failure_time
                .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout);
            if recovered {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.half_open_calls = 0;
            }
        }
        inner.state == CircuitState::Open
    }

    /// Record a successful call outcome
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    tracing::info!(
                        breaker = %self.name,
                        successes = inner.success_count,
                        "Circuit recovered, closing"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_calls = 0;
                }
            }
            CircuitState::Open => {
                // A straggler from before the trip; the next admission
                // check still governs recovery.
            }
        }
    }

    /// Record a failed call outcome
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        recovery_secs = self.config.recovery_timeout.as_secs_f64(),
                        "Circuit tripped"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    breaker = %self.name,
                    "Half-open probe failed, circuit re-tripped"
                );
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Execute an operation through the breaker
    ///
    /// Fails fast with [`GatewayError::CircuitOpen`] when admission is
    /// denied. Transient errors are recorded as failures and re-raised;
    /// fatal errors propagate without affecting breaker state, so
    /// programming errors never trip the circuit.
    pub async fn call<T, F, Fut>(&self, op: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        if !self.should_allow_request() {
            let stats = self.stats();
            return Err(GatewayError::CircuitOpen {
                provider: self.name.clone(),
                state: stats.state,
                failures: stats.failure_count,
            });
        }

        // Outside the lock: concurrent calls through a healthy breaker
        // must not serialize.
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.class() == ErrorClass::Transient {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }

    /// Force the circuit closed and zero all transition counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        tracing::info!(breaker = %self.name, "Circuit manually reset to closed");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        inner.last_failure_time = None;
    }

    /// Force the circuit open for operational control
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        tracing::warn!(breaker = %self.name, "Circuit manually forced open");
        inner.state = CircuitState::Open;
        inner.last_failure_time = Some(Instant::now());
    }

    /// Snapshot current counters for the metrics sink
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            total_calls: inner.total_calls,
            blocked_calls: inner.blocked_calls,
        }
    }
}
