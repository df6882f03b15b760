//! Primary/secondary failover for a provider pairing
//!
//! Composes a retry loop around the primary provider with a lightweight
//! circuit scoped to the pairing. The circuit here is deliberately simpler
//! than [`crate::breaker::CircuitBreaker`]: it has no half-open phase and
//! self-resets lazily once the reset timeout elapses. Two callers racing
//! the reset boundary may briefly disagree; the worst case is one extra
//! fallback, which is accepted.

use crate::error::{ErrorClass, GatewayError, GatewayResult};
use crate::provider::{ChatMessage, ChatRequest, Completion, ProviderClient};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Tuning for a fallback pairing
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Attempts against the primary before failing over
    pub retry_count: u32,
    /// Primary failures before the internal circuit opens
    pub circuit_breaker_threshold: u32,
    /// How long the internal circuit stays open
    pub circuit_reset_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            circuit_breaker_threshold: 5,
            circuit_reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct FallbackState {
    circuit_open: bool,
    circuit_open_time: Option<Instant>,
    failure_count: u32,
    total_requests: u64,
    fallback_count: u64,
}

/// Aggregate statistics for the pairing
#[derive(Debug, Clone)]
pub struct FallbackStatistics {
    pub total_requests: u64,
    pub fallback_count: u64,
    pub failure_count: u32,
    /// `fallback_count / total_requests`, zero before any traffic
    pub fallback_rate: f64,
    pub circuit_open: bool,
}

/// Response from the pairing, tagged with who served it
#[derive(Debug, Clone)]
pub struct FallbackResponse {
    pub completion: Completion,
    /// Name of the provider that produced the completion
    pub provider: String,
    /// True when the secondary served the request
    pub via_fallback: bool,
}

/// Attempts a primary provider and fails over to a secondary
pub struct FallbackHandler {
    primary: Arc<dyn ProviderClient>,
    secondary: Arc<dyn ProviderClient>,
    config: FallbackConfig,
    state: Mutex<FallbackState>,
}

impl FallbackHandler {
    /// Create a handler for the primary/secondary pairing
    pub fn new(
        primary: Arc<dyn ProviderClient>,
        secondary: Arc<dyn ProviderClient>,
        config: FallbackConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            config,
            state: Mutex::new(FallbackState {
                circuit_open: false,
                circuit_open_time: None,
                failure_count: 0,
                total_requests: 0,
                fallback_count: 0,
            }),
        }
    }

    /// Execute the request against the primary, failing over to the
    /// secondary when the primary is exhausted or its circuit is open
    ///
    /// Fatal errors (validation, auth) propagate immediately from either
    /// provider and never count against the circuit. The secondary gets a
    /// single attempt with no retry wrapping.
    pub async fn execute_with_fallback(
        &self,
        request: &ChatRequest,
    ) -> GatewayResult<FallbackResponse> {
        {
            let mut state = self.state.lock().expect("fallback lock poisoned");
            state.total_requests += 1;
        }

        let mut primary_error: Option<GatewayError> = None;
        if !self.is_circuit_open() {
            match self.try_primary(request).await {
                Ok(completion) => {
                    return Ok(FallbackResponse {
                        completion,
                        provider: self.primary.name().to_string(),
                        via_fallback: false,
                    });
                }
                Err(err) if err.class() == ErrorClass::Fatal => return Err(err),
                Err(err) => {
                    self.record_primary_failure();
                    tracing::warn!(
                        primary = self.primary.name(),
                        secondary = self.secondary.name(),
                        error = %err,
                        "Primary exhausted, failing over"
                    );
                    primary_error = Some(err);
                }
            }
        } else {
            tracing::debug!(
                primary = self.primary.name(),
                "Circuit open, skipping primary"
            );
        }

        {
            let mut state = self.state.lock().expect("fallback lock poisoned");
            state.fallback_count += 1;
        }

        match self.secondary.complete(request).await {
            Ok(completion) => Ok(FallbackResponse {
                completion,
                provider: self.secondary.name().to_string(),
                via_fallback: true,
            }),
            Err(err) if err.class() == ErrorClass::Fatal => Err(err),
            Err(err) => Err(GatewayError::AllProvidersFailed {
                primary: self.primary.name().to_string(),
                secondary: self.secondary.name().to_string(),
                reason: match primary_error {
                    Some(p) => format!("primary: {p}; secondary: {err}"),
                    None => format!("secondary: {err} (primary skipped, circuit open)"),
                },
            }),
        }
    }

    /// Retry the primary up to `retry_count` times with plain exponential
    /// spacing (`2^attempt` seconds, no jitter); the last error is
    /// re-raised after exhaustion
    async fn try_primary(&self, request: &ChatRequest) -> GatewayResult<Completion> {
        let mut last_error = None;
        for attempt in 1..=self.config.retry_count {
            match self.primary.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(err) if err.class() == ErrorClass::Fatal => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        primary = self.primary.name(),
                        attempt,
                        retry_count = self.config.retry_count,
                        error = %err,
                        "Primary attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < self.config.retry_count {
                        let wait = Duration::from_secs(2u64.saturating_pow(attempt));
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            GatewayError::Internal("primary retry loop produced no error".to_string())
        }))
    }

    fn record_primary_failure(&self) {
        let mut state = self.state.lock().expect("fallback lock poisoned");
        state.failure_count += 1;
        if state.failure_count >= self.config.circuit_breaker_threshold && !state.circuit_open {
            tracing::warn!(
                primary = self.primary.name(),
                failures = state.failure_count,
                reset_secs = self.config.circuit_reset_timeout.as_secs_f64(),
                "Fallback circuit opened for primary"
            );
            state.circuit_open = true;
            state.circuit_open_time = Some(Instant::now());
        }
    }

    /// Whether the internal circuit currently skips the primary
    ///
    /// Reset is lazy: the first read after `circuit_reset_timeout` closes
    /// the circuit and clears the failure count.
    pub fn is_circuit_open(&self) -> bool {
        let mut state = self.state.lock().expect("fallback lock poisoned");
        if state.circuit_open
            && state
                .circuit_open_time
                .is_some_and(|t| t.elapsed() >= self.config.circuit_reset_timeout)
        {
            tracing::info!(
                primary = self.primary.name(),
                "Fallback circuit reset, primary eligible again"
            );
            state.circuit_open = false;
            state.circuit_open_time = None;
            state.failure_count = 0;
        }
        state.circuit_open
    }

    /// Name of the primary provider
    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    /// Name of the secondary provider
    pub fn secondary_name(&self) -> &str {
        self.secondary.name()
    }

    /// Best-effort probe for a healthy provider name
    ///
    /// Tries the primary first unless its circuit is open, then the
    /// secondary; `None` when both look down.
    pub async fn healthy_provider(&self) -> Option<String> {
        if !self.is_circuit_open() && self.primary.health_check().await {
            return Some(self.primary.name().to_string());
        }
        if self.secondary.health_check().await {
            return Some(self.secondary.name().to_string());
        }
        None
    }

    /// Aggregate statistics snapshot
    pub fn statistics(&self) -> FallbackStatistics {
        let state = self.state.lock().expect("fallback lock poisoned");
        let fallback_rate = if state.total_requests > 0 {
            state.fallback_count as f64 / state.total_requests as f64
        } else {
            0.0
        };
        FallbackStatistics {
            total_requests: state.total_requests,
            fallback_count: state.fallback_count,
            failure_count: state.failure_count,
            fallback_rate,
            circuit_open: state.circuit_open,
        }
    }

    /// Diagnostic: confirm failover works end-to-end
    ///
    /// When the primary is unhealthy and the secondary healthy, issues a
    /// synthetic request through `execute_with_fallback` and reports
    /// whether the secondary actually served it. Returns false when the
    /// precondition does not hold.
    pub async fn test_failover(&self) -> GatewayResult<bool> {
        let primary_healthy = self.primary.health_check().await;
        let secondary_healthy = self.secondary.health_check().await;

        if primary_healthy || !secondary_healthy {
            tracing::debug!(
                primary_healthy,
                secondary_healthy,
                "Failover test precondition not met"
            );
            return Ok(false);
        }

        let synthetic = ChatRequest {
            messages: vec![ChatMessage::user("failover probe")],
            model: None,
            temperature: None,
            max_tokens: Some(1),
            stream: false,
            tenant_id: "modelgate-diagnostic".to_string(),
        };
        let response = self.execute_with_fallback(&synthetic).await?;
        Ok(response.via_fallback)
    }
}
