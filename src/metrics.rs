//! Metrics sink for the orchestration core
//!
//! The core reports per-call outcomes, circuit breaker transitions, and
//! rate limit exceedances through the `MetricsSink` trait. Sink calls are
//! fire-and-forget: a failing sink must never fail a request, so the
//! Prometheus implementation logs recording errors and continues.

use crate::breaker::CircuitState;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Outcome label for a provider request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Failure,
}

impl RequestStatus {
    /// Label string for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Fire-and-forget observability boundary
///
/// Implementations must be cheap and infallible from the caller's point
/// of view.
pub trait MetricsSink: Send + Sync {
    /// Record one provider call outcome with latency, token usage, and
    /// computed cost
    fn record_provider_request(
        &self,
        provider: &str,
        model: &str,
        status: RequestStatus,
        latency: Duration,
        tokens: u32,
        cost: f64,
    );

    /// Record a circuit breaker state and its failure count
    fn update_circuit_breaker(&self, provider: &str, state: CircuitState, failures: u32);

    /// Record a tenant hitting the gateway's own rate limit
    fn record_rate_limit_exceeded(&self, tenant: &str, endpoint: &str);
}

/// Sink that discards everything; useful in tests
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_provider_request(
        &self,
        _provider: &str,
        _model: &str,
        _status: RequestStatus,
        _latency: Duration,
        _tokens: u32,
        _cost: f64,
    ) {
    }

    fn update_circuit_breaker(&self, _provider: &str, _state: CircuitState, _failures: u32) {}

    fn record_rate_limit_exceeded(&self, _tenant: &str, _endpoint: &str) {}
}

/// Prometheus-backed metrics sink
///
/// Labels are restricted to provider/model/status/tenant/endpoint values
/// the gateway already bounds, keeping cardinality under control.
#[derive(Clone)]
pub struct PrometheusMetrics {
    pub registry: Arc<Registry>,
    provider_requests: IntCounterVec,
    request_latency: HistogramVec,
    tokens_total: IntCounterVec,
    cost_total: CounterVec,
    breaker_state: IntGaugeVec,
    breaker_failures: IntGaugeVec,
    rate_limit_exceeded: IntCounterVec,
}

impl PrometheusMetrics {
    /// Create a sink with a fresh registry
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g. duplicate
    /// names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let provider_requests = IntCounterVec::new(
            Opts::new(
                "modelgate_provider_requests_total",
                "Provider requests by provider, model, and outcome",
            ),
            &["provider", "model", "status"],
        )?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "modelgate_provider_latency_seconds",
                "Provider call latency in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["provider", "model"],
        )?;

        let tokens_total = IntCounterVec::new(
            Opts::new(
                "modelgate_tokens_total",
                "Total tokens processed by provider and model",
            ),
            &["provider", "model"],
        )?;

        let cost_total = CounterVec::new(
            Opts::new(
                "modelgate_cost_total",
                "Accumulated cost by provider and model",
            ),
            &["provider", "model"],
        )?;

        // Gauge encoding: closed = 0, open = 1, half_open = 2
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "modelgate_circuit_breaker_state",
                "Circuit breaker state per provider (0 closed, 1 open, 2 half-open)",
            ),
            &["provider"],
        )?;

        let breaker_failures = IntGaugeVec::new(
            Opts::new(
                "modelgate_circuit_breaker_failures",
                "Current consecutive failure count per provider",
            ),
            &["provider"],
        )?;

        let rate_limit_exceeded = IntCounterVec::new(
            Opts::new(
                "modelgate_rate_limit_exceeded_total",
                "Gateway rate limit rejections by tenant and endpoint",
            ),
            &["tenant", "endpoint"],
        )?;

        registry.register(Box::new(provider_requests.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(cost_total.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(breaker_failures.clone()))?;
        registry.register(Box::new(rate_limit_exceeded.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            provider_requests,
            request_latency,
            tokens_total,
            cost_total,
            breaker_state,
            breaker_failures,
            rate_limit_exceeded,
        })
    }

    /// Render the registry in Prometheus text exposition format
    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_provider_request(
        &self,
        provider: &str,
        model: &str,
        status: RequestStatus,
        latency: Duration,
        tokens: u32,
        cost: f64,
    ) {
        self.provider_requests
            .with_label_values(&[provider, model, status.as_str()])
            .inc();
        self.request_latency
            .with_label_values(&[provider, model])
            .observe(latency.as_secs_f64());
        self.tokens_total
            .with_label_values(&[provider, model])
            .inc_by(u64::from(tokens));
        self.cost_total
            .with_label_values(&[provider, model])
            .inc_by(cost);
    }

    fn update_circuit_breaker(&self, provider: &str, state: CircuitState, failures: u32) {
        let encoded = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.breaker_state
            .with_label_values(&[provider])
            .set(encoded);
        self.breaker_failures
            .with_label_values(&[provider])
            .set(i64::from(failures));
    }

    fn record_rate_limit_exceeded(&self, tenant: &str, endpoint: &str) {
        self.rate_limit_exceeded
            .with_label_values(&[tenant, endpoint])
            .inc();
    }
}
