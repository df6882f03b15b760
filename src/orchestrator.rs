//! Top-level orchestration façade
//!
//! Receives a normalized chat request, consults the cache, selects a
//! provider/model through the router, executes the call behind a circuit
//! breaker and retry handler (or a fallback pairing when configured), and
//! feeds the outcome back into routing scores and the metrics sink.
//!
//! All collaborators are injected at construction; there are no
//! process-wide singletons.

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::cache::{CacheStore, cache_key};
use crate::client::HttpProviderClient;
use crate::config::GatewayConfig;
use crate::error::{ErrorClass, GatewayError, GatewayResult};
use crate::fallback::{FallbackConfig, FallbackHandler};
use crate::metrics::{MetricsSink, RequestStatus};
use crate::provider::{ChatRequest, GatewayResponse, ProviderClient, Usage};
use crate::ratelimit::RateLimiter;
use crate::retry::{RetryHandler, RetryPolicy};
use crate::router::{ModelRouter, model_key};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Endpoint label used for tenant rate limiting and metrics
const CHAT_ENDPOINT: &str = "chat";

/// Runtime settings for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub cache_ttl: Duration,
    /// Whole-call deadline applied to every request
    pub request_deadline: Option<Duration>,
    /// Distinct candidates one request may try before giving up
    pub max_route_attempts: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            cache_ttl: Duration::from_secs(300),
            request_deadline: None,
            max_route_attempts: 3,
        }
    }
}

/// Orchestrates provider requests end to end
pub struct ProviderOrchestrator {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
    router: Arc<ModelRouter>,
    cache: Arc<dyn CacheStore>,
    metrics: Arc<dyn MetricsSink>,
    rate_limiter: Option<Arc<RateLimiter>>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    fallback: Option<Arc<FallbackHandler>>,
    config: OrchestratorConfig,
}

impl ProviderOrchestrator {
    /// Create an orchestrator from explicit collaborators
    ///
    /// One circuit breaker is created per provider client. Models must be
    /// registered on `router` separately; selections naming a provider
    /// without a client fail the request as an internal error.
    pub fn new(
        clients: Vec<Arc<dyn ProviderClient>>,
        router: Arc<ModelRouter>,
        cache: Arc<dyn CacheStore>,
        metrics: Arc<dyn MetricsSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let mut client_map = HashMap::new();
        let mut breakers = HashMap::new();
        for client in clients {
            let name = client.name().to_string();
            breakers.insert(
                name.clone(),
                Arc::new(CircuitBreaker::new(name.clone(), config.breaker.clone())),
            );
            client_map.insert(name, client);
        }
        Self {
            clients: client_map,
            router,
            cache,
            metrics,
            rate_limiter: None,
            breakers,
            fallback: None,
            config,
        }
    }

    /// Build a fully wired orchestrator from file-loaded configuration
    ///
    /// Constructs one HTTP client per distinct provider name, registers
    /// every model on the router, and wires the fallback pairing and rate
    /// limiter when configured.
    pub fn from_config(
        config: &GatewayConfig,
        cache: Arc<dyn CacheStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> GatewayResult<Self> {
        let router = Arc::new(ModelRouter::new(config.orchestrator.strategy));
        let mut clients: Vec<Arc<dyn ProviderClient>> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for entry in &config.providers {
            router.register_model(
                &entry.provider,
                &entry.model,
                entry.cost_per_token,
                entry.quality_score,
                entry.weight,
            );
            if seen.insert(entry.provider.clone()) {
                clients.push(Arc::new(HttpProviderClient::new(
                    entry.provider.clone(),
                    entry.base_url.clone(),
                    entry.model.clone(),
                    entry.api_key.clone(),
                    config.request_deadline().unwrap_or(Duration::from_secs(60)),
                )?));
            }
        }

        let settings = OrchestratorConfig {
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                min_wait: Duration::from_millis(config.retry.min_wait_ms),
                max_wait: Duration::from_millis(config.retry.max_wait_ms),
                multiplier: 2.0,
                jitter: config.retry.jitter,
            },
            breaker: BreakerConfig {
                failure_threshold: config.breaker.failure_threshold,
                recovery_timeout: Duration::from_secs(config.breaker.recovery_timeout_seconds),
                half_open_max_calls: config.breaker.half_open_max_calls,
            },
            cache_ttl: config.cache_ttl(),
            request_deadline: config.request_deadline(),
            max_route_attempts: config.orchestrator.max_route_attempts,
        };

        let mut orchestrator = Self::new(clients, router, cache, metrics.clone(), settings);

        if config.ratelimit.enabled {
            orchestrator = orchestrator.with_rate_limiter(Arc::new(RateLimiter::new(
                config.ratelimit.burst,
                config.ratelimit.per_second,
                metrics,
            )));
        }

        if let Some(fb) = &config.fallback {
            let primary = orchestrator
                .clients
                .get(&fb.primary)
                .cloned()
                .ok_or_else(|| {
                    GatewayError::Config(format!("fallback primary {} has no client", fb.primary))
                })?;
            let secondary = orchestrator
                .clients
                .get(&fb.secondary)
                .cloned()
                .ok_or_else(|| {
                    GatewayError::Config(format!(
                        "fallback secondary {} has no client",
                        fb.secondary
                    ))
                })?;
            orchestrator = orchestrator.with_fallback(Arc::new(FallbackHandler::new(
                primary,
                secondary,
                FallbackConfig {
                    retry_count: fb.retry_count,
                    circuit_breaker_threshold: fb.circuit_breaker_threshold,
                    circuit_reset_timeout: Duration::from_secs(fb.circuit_reset_timeout_seconds),
                },
            )));
        }

        Ok(orchestrator)
    }

    /// Route all traffic through a primary/secondary fallback pairing
    pub fn with_fallback(mut self, fallback: Arc<FallbackHandler>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Apply gateway-side tenant rate limiting
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// The router this orchestrator selects with
    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    /// Breaker stats for one provider, if it exists
    pub fn breaker_stats(&self, provider: &str) -> Option<crate::breaker::BreakerStats> {
        self.breakers.get(provider).map(|b| b.stats())
    }

    /// Execute a chat request end to end
    ///
    /// A cache hit bypasses routing and breakers entirely. On exhaustion
    /// of every candidate the caller sees a "no healthy provider" error,
    /// never a raw transport failure.
    pub async fn execute(&self, request: &ChatRequest) -> GatewayResult<GatewayResponse> {
        request.validate()?;
        let request_id = Uuid::new_v4();

        if let Some(limiter) = &self.rate_limiter
            && !limiter.check(&request.tenant_id, CHAT_ENDPOINT)
        {
            return Err(GatewayError::RateLimited {
                tenant: request.tenant_id.clone(),
                endpoint: CHAT_ENDPOINT.to_string(),
            });
        }

        let key = cache_key(request);
        if let Some(mut hit) = self.cache.get(&key).await {
            tracing::debug!(
                request_id = %request_id,
                tenant = %request.tenant_id,
                "Cache hit, bypassing orchestration"
            );
            hit.cached = true;
            return Ok(hit);
        }

        let deadline = self.config.request_deadline.map(|d| Instant::now() + d);

        let response = if let Some(fallback) = &self.fallback {
            self.execute_via_fallback(request, request_id, fallback)
                .await?
        } else {
            self.execute_routed(request, request_id, deadline).await?
        };

        // Caching is an optimization: a failed write must never fail the
        // request.
        if let Err(e) = self
            .cache
            .set(&key, response.clone(), self.config.cache_ttl)
            .await
        {
            tracing::warn!(
                request_id = %request_id,
                error = %e,
                "Cache write failed, continuing"
            );
        }

        Ok(response)
    }

    /// Routed path: candidate loop with per-request exclusion
    ///
    /// A candidate that fails or is circuit-blocked is excluded and
    /// routing retried against the remainder, so one request never burns
    /// two attempts on the same dead pair.
    async fn execute_routed(
        &self,
        request: &ChatRequest,
        request_id: Uuid,
        deadline: Option<Instant>,
    ) -> GatewayResult<GatewayResponse> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error: Option<GatewayError> = None;

        for attempt in 1..=self.config.max_route_attempts {
            let Some((provider, model)) = self.router.select_model(&excluded) else {
                break;
            };

            let client = self.clients.get(&provider).ok_or_else(|| {
                GatewayError::Internal(format!("no client registered for provider {provider}"))
            })?;
            let breaker = self.breakers.get(&provider).ok_or_else(|| {
                GatewayError::Internal(format!("no breaker registered for provider {provider}"))
            })?;

            tracing::debug!(
                request_id = %request_id,
                provider = %provider,
                model = %model,
                attempt,
                "Dispatching to provider"
            );

            let mut retry = RetryHandler::new(self.config.retry.clone());
            if let Some(d) = deadline {
                retry = retry.with_deadline(d);
            }

            let attempt_request = Self::pin_model(request, &model);
            let started = Instant::now();
            let result = breaker
                .call(|| retry.execute(|| client.complete(&attempt_request)))
                .await;
            let latency = started.elapsed();

            match result {
                Ok(completion) => {
                    self.record_outcome(&provider, &model, RequestStatus::Success, latency, completion.usage);
                    self.router
                        .record_success(&provider, &model, latency.as_secs_f64());
                    tracing::info!(
                        request_id = %request_id,
                        provider = %provider,
                        model = %model,
                        latency_ms = latency.as_millis() as u64,
                        tokens = completion.usage.total_tokens,
                        "Request served"
                    );
                    return Ok(GatewayResponse {
                        content: completion.content,
                        usage: completion.usage,
                        provider,
                        model,
                        latency_ms: latency.as_millis() as u64,
                        cached: false,
                    });
                }
                Err(err @ GatewayError::CircuitOpen { .. }) => {
                    // Local admission decision: not a provider failure, so
                    // routing scores are untouched.
                    tracing::debug!(
                        request_id = %request_id,
                        provider = %provider,
                        "Circuit open, excluding candidate"
                    );
                    excluded.insert(model_key(&provider, &model));
                    last_error = Some(err);
                }
                Err(err @ GatewayError::DeadlineExceeded { .. }) => {
                    tracing::warn!(
                        request_id = %request_id,
                        provider = %provider,
                        "Deadline exceeded during orchestration"
                    );
                    return Err(err);
                }
                Err(err) if err.class() == ErrorClass::Fatal => {
                    // Programming/validation errors propagate immediately
                    // and never affect routing state.
                    return Err(err);
                }
                Err(err) => {
                    self.record_outcome(&provider, &model, RequestStatus::Failure, latency, Usage::default());
                    self.router.record_failure(&provider, &model);
                    tracing::warn!(
                        request_id = %request_id,
                        provider = %provider,
                        model = %model,
                        error = %err,
                        "Provider failed, excluding candidate"
                    );
                    excluded.insert(model_key(&provider, &model));
                    last_error = Some(err);
                }
            }
        }

        Err(GatewayError::NoHealthyProvider(match last_error {
            Some(err) => format!("all candidates exhausted, last error: {err}"),
            None => "no available candidates".to_string(),
        }))
    }

    /// Fallback path: the pairing handles retries and failover itself
    async fn execute_via_fallback(
        &self,
        request: &ChatRequest,
        request_id: Uuid,
        fallback: &Arc<FallbackHandler>,
    ) -> GatewayResult<GatewayResponse> {
        let started = Instant::now();
        match fallback.execute_with_fallback(request).await {
            Ok(response) => {
                let latency = started.elapsed();
                let model = request.model.clone().unwrap_or_else(|| "default".to_string());
                self.record_outcome(
                    &response.provider,
                    &model,
                    RequestStatus::Success,
                    latency,
                    response.completion.usage,
                );
                self.router
                    .record_success(&response.provider, &model, latency.as_secs_f64());
                tracing::info!(
                    request_id = %request_id,
                    provider = %response.provider,
                    via_fallback = response.via_fallback,
                    latency_ms = latency.as_millis() as u64,
                    "Request served via fallback pairing"
                );
                Ok(GatewayResponse {
                    content: response.completion.content,
                    usage: response.completion.usage,
                    provider: response.provider,
                    model,
                    latency_ms: latency.as_millis() as u64,
                    cached: false,
                })
            }
            Err(err) => {
                // Exhaustion is reported against the pairing's primary, the
                // path of record for routing and alerting. Fatal provider
                // errors (validation, auth) propagate without touching
                // routing state, same as the routed path.
                if matches!(err, GatewayError::AllProvidersFailed { .. }) {
                    let latency = started.elapsed();
                    let model =
                        request.model.clone().unwrap_or_else(|| "default".to_string());
                    let primary = fallback.primary_name();
                    self.record_outcome(
                        primary,
                        &model,
                        RequestStatus::Failure,
                        latency,
                        Usage::default(),
                    );
                    self.router.record_failure(primary, &model);
                }
                tracing::warn!(
                    request_id = %request_id,
                    error = %err,
                    "Fallback pairing exhausted"
                );
                Err(err)
            }
        }
    }

    /// Execute a streaming request through routing and the breaker
    ///
    /// Streams are not cached and not retried: a broken stream surfaces
    /// to the caller, who may reissue the request.
    pub async fn execute_stream(&self, request: &ChatRequest) -> GatewayResult<Vec<String>> {
        request.validate()?;
        let request_id = Uuid::new_v4();

        let (provider, model) = self
            .router
            .select_model(&HashSet::new())
            .ok_or_else(|| GatewayError::NoHealthyProvider("no available candidates".to_string()))?;
        let client = self.clients.get(&provider).ok_or_else(|| {
            GatewayError::Internal(format!("no client registered for provider {provider}"))
        })?;
        let breaker = self.breakers.get(&provider).ok_or_else(|| {
            GatewayError::Internal(format!("no breaker registered for provider {provider}"))
        })?;

        let attempt_request = Self::pin_model(request, &model);
        let started = Instant::now();
        let result = breaker.call(|| client.stream(&attempt_request)).await;
        let latency = started.elapsed();

        match result {
            Ok(deltas) => {
                // Streams carry no usage block; tokens and cost report zero
                self.record_outcome(
                    &provider,
                    &model,
                    RequestStatus::Success,
                    latency,
                    Usage::default(),
                );
                self.router
                    .record_success(&provider, &model, latency.as_secs_f64());
                tracing::info!(
                    request_id = %request_id,
                    provider = %provider,
                    chunks = deltas.len(),
                    "Stream served"
                );
                Ok(deltas)
            }
            Err(err) => {
                if err.is_retryable() {
                    self.record_outcome(
                        &provider,
                        &model,
                        RequestStatus::Failure,
                        latency,
                        Usage::default(),
                    );
                    self.router.record_failure(&provider, &model);
                }
                Err(err)
            }
        }
    }

    /// Probe every provider concurrently
    ///
    /// Intended for an outer health endpoint; does not touch breaker or
    /// routing state.
    pub async fn health_snapshot(&self) -> HashMap<String, bool> {
        let probes = self.clients.values().map(|client| async move {
            (client.name().to_string(), client.health_check().await)
        });
        futures::future::join_all(probes).await.into_iter().collect()
    }

    /// Push one outcome into the metrics sink and breaker gauges
    fn record_outcome(
        &self,
        provider: &str,
        model: &str,
        status: RequestStatus,
        latency: Duration,
        usage: Usage,
    ) {
        let cost = self
            .router
            .cost_per_token(provider, model)
            .unwrap_or(0.0)
            * f64::from(usage.total_tokens);
        self.metrics.record_provider_request(
            provider,
            model,
            status,
            latency,
            usage.total_tokens,
            cost,
        );
        if let Some(breaker) = self.breakers.get(provider) {
            let stats = breaker.stats();
            self.metrics
                .update_circuit_breaker(provider, stats.state, stats.failure_count);
        }
    }

    /// Clone of the request with the routed model pinned
    fn pin_model(request: &ChatRequest, model: &str) -> ChatRequest {
        let mut pinned = request.clone();
        pinned.model = Some(model.to_string());
        pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::metrics::NoopMetrics;
    use crate::provider::{ChatMessage, Completion};
    use crate::router::SelectionStrategy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubProvider {
        name: String,
        fail: bool,
        calls: AtomicU32,
    }

    impl StubProvider {
        fn ok(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: true,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _request: &ChatRequest) -> GatewayResult<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(GatewayError::ProviderTransient {
                    provider: self.name.clone(),
                    reason: "stub failure".to_string(),
                })
            } else {
                Ok(Completion {
                    content: format!("reply from {}", self.name),
                    usage: Usage {
                        prompt_tokens: 10,
                        completion_tokens: 20,
                        total_tokens: 30,
                    },
                })
            }
        }

        async fn stream(&self, request: &ChatRequest) -> GatewayResult<Vec<String>> {
            self.complete(request)
                .await
                .map(|c| vec![c.content.clone(), "done".to_string()])
        }

        async fn health_check(&self) -> bool {
            !self.fail
        }
    }

    #[derive(Default)]
    struct CountingMetrics {
        successes: AtomicU32,
        failures: AtomicU32,
    }

    impl MetricsSink for CountingMetrics {
        fn record_provider_request(
            &self,
            _provider: &str,
            _model: &str,
            status: RequestStatus,
            _latency: Duration,
            _tokens: u32,
            _cost: f64,
        ) {
            match status {
                RequestStatus::Success => self.successes.fetch_add(1, Ordering::SeqCst),
                RequestStatus::Failure => self.failures.fetch_add(1, Ordering::SeqCst),
            };
        }

        fn update_circuit_breaker(
            &self,
            _provider: &str,
            _state: crate::breaker::CircuitState,
            _failures: u32,
        ) {
        }

        fn record_rate_limit_exceeded(&self, _tenant: &str, _endpoint: &str) {}
    }

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user("hello")],
            model: None,
            temperature: None,
            max_tokens: None,
            stream: false,
            tenant_id: "acme".to_string(),
        }
    }

    fn quick_settings() -> OrchestratorConfig {
        OrchestratorConfig {
            retry: RetryPolicy::with_linear_backoff(2, Duration::from_millis(1)),
            breaker: BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_millis(50),
                half_open_max_calls: 1,
            },
            cache_ttl: Duration::from_secs(60),
            request_deadline: None,
            max_route_attempts: 3,
        }
    }

    fn orchestrator_with(
        clients: Vec<Arc<dyn ProviderClient>>,
        strategy: SelectionStrategy,
    ) -> ProviderOrchestrator {
        let router = Arc::new(ModelRouter::new(strategy));
        ProviderOrchestrator::new(
            clients,
            router,
            Arc::new(MemoryCache::new()),
            Arc::new(NoopMetrics),
            quick_settings(),
        )
    }

    #[tokio::test]
    async fn test_execute_happy_path_records_success() {
        let provider = StubProvider::ok("openai");
        let orchestrator = orchestrator_with(vec![provider], SelectionStrategy::Random);
        orchestrator
            .router()
            .register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);

        let response = orchestrator.execute(&request()).await.unwrap();
        assert_eq!(response.provider, "openai");
        assert_eq!(response.model, "gpt-3.5");
        assert!(!response.cached);
        assert_eq!(response.usage.total_tokens, 30);

        let snapshot = orchestrator.router().metrics_snapshot();
        assert_eq!(snapshot[0].total_requests, 1);
        assert_eq!(snapshot[0].failed_requests, 0);
    }

    #[tokio::test]
    async fn test_second_identical_request_hits_cache() {
        let provider = StubProvider::ok("openai");
        let orchestrator = orchestrator_with(vec![provider.clone()], SelectionStrategy::Random);
        orchestrator
            .router()
            .register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);

        let first = orchestrator.execute(&request()).await.unwrap();
        assert!(!first.cached);
        let second = orchestrator.execute(&request()).await.unwrap();
        assert!(second.cached);
        // Provider called exactly once: the hit bypassed everything
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_provider_excluded_and_next_tried() {
        let bad = StubProvider::failing("openai");
        let good = StubProvider::ok("anthropic");
        let orchestrator = orchestrator_with(
            vec![bad.clone(), good.clone()],
            SelectionStrategy::CostOptimized,
        );
        // openai is cheaper so it is tried first, fails, gets excluded
        orchestrator
            .router()
            .register_model("openai", "gpt-3.5", 0.0001, 0.8, 1.0);
        orchestrator
            .router()
            .register_model("anthropic", "haiku", 0.001, 0.75, 1.0);

        let response = orchestrator.execute(&request()).await.unwrap();
        assert_eq!(response.provider, "anthropic");
        // Retry policy allows 2 attempts against the failing provider
        assert_eq!(bad.calls.load(Ordering::SeqCst), 2);

        let snapshot = orchestrator.router().metrics_snapshot();
        let openai = snapshot.iter().find(|m| m.provider == "openai").unwrap();
        assert_eq!(openai.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_all_failing_surfaces_no_healthy_provider() {
        let bad = StubProvider::failing("openai");
        let orchestrator = orchestrator_with(vec![bad], SelectionStrategy::Random);
        orchestrator
            .router()
            .register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);

        let err = orchestrator.execute(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyProvider(_)));
    }

    #[tokio::test]
    async fn test_no_registered_models_fails_cleanly() {
        let orchestrator =
            orchestrator_with(vec![StubProvider::ok("openai")], SelectionStrategy::Random);
        let err = orchestrator.execute(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyProvider(_)));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_routing() {
        let provider = StubProvider::ok("openai");
        let orchestrator = orchestrator_with(vec![provider.clone()], SelectionStrategy::Random);
        orchestrator
            .router()
            .register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);

        let mut bad = request();
        bad.messages.clear();
        let err = orchestrator.execute(&bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        // Router state untouched by the validation failure
        assert_eq!(orchestrator.router().metrics_snapshot()[0].total_requests, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_tenant_rejected() {
        let provider = StubProvider::ok("openai");
        let orchestrator = orchestrator_with(vec![provider], SelectionStrategy::Random)
            .with_rate_limiter(Arc::new(RateLimiter::new(
                1.0,
                0.0,
                Arc::new(NoopMetrics),
            )));
        orchestrator
            .router()
            .register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);

        assert!(orchestrator.execute(&request()).await.is_ok());
        // Limiting applies before the cache lookup, so even the identical
        // request is rejected
        let err = orchestrator.execute(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_fallback_pairing_used_when_configured() {
        let primary = StubProvider::failing("openai");
        let secondary = StubProvider::ok("anthropic");
        let router = Arc::new(ModelRouter::new(SelectionStrategy::Random));
        router.register_model("openai", "default", 0.002, 0.8, 1.0);
        router.register_model("anthropic", "default", 0.00025, 0.75, 1.0);

        let fallback = Arc::new(FallbackHandler::new(
            primary.clone(),
            secondary.clone(),
            FallbackConfig {
                retry_count: 1,
                circuit_breaker_threshold: 5,
                circuit_reset_timeout: Duration::from_secs(60),
            },
        ));
        let orchestrator = ProviderOrchestrator::new(
            vec![primary, secondary],
            router,
            Arc::new(MemoryCache::new()),
            Arc::new(NoopMetrics),
            quick_settings(),
        )
        .with_fallback(fallback.clone());

        let response = orchestrator.execute(&request()).await.unwrap();
        assert_eq!(response.provider, "anthropic");
        assert_eq!(fallback.statistics().fallback_count, 1);
    }

    #[tokio::test]
    async fn test_exhausted_fallback_reports_failure_outcome() {
        let primary = StubProvider::failing("openai");
        let secondary = StubProvider::failing("anthropic");
        let router = Arc::new(ModelRouter::new(SelectionStrategy::Random));
        router.register_model("openai", "default", 0.002, 0.8, 1.0);
        router.register_model("anthropic", "default", 0.00025, 0.75, 1.0);

        let metrics = Arc::new(CountingMetrics::default());
        let fallback = Arc::new(FallbackHandler::new(
            primary.clone(),
            secondary,
            FallbackConfig {
                retry_count: 1,
                circuit_breaker_threshold: 5,
                circuit_reset_timeout: Duration::from_secs(60),
            },
        ));
        let orchestrator = ProviderOrchestrator::new(
            vec![primary],
            router,
            Arc::new(MemoryCache::new()),
            metrics.clone(),
            quick_settings(),
        )
        .with_fallback(fallback);

        let err = orchestrator.execute(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AllProvidersFailed { .. }));

        // Exhaustion is visible to the sink and the routing scores
        assert_eq!(metrics.failures.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.successes.load(Ordering::SeqCst), 0);
        let snapshot = orchestrator.router().metrics_snapshot();
        let openai = snapshot.iter().find(|m| m.provider == "openai").unwrap();
        assert_eq!(openai.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_stream_outcomes_reach_metrics_sink() {
        let metrics = Arc::new(CountingMetrics::default());
        let router = Arc::new(ModelRouter::new(SelectionStrategy::Random));
        router.register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);
        let orchestrator = ProviderOrchestrator::new(
            vec![StubProvider::ok("openai")],
            router,
            Arc::new(MemoryCache::new()),
            metrics.clone(),
            quick_settings(),
        );

        orchestrator.execute_stream(&request()).await.unwrap();
        assert_eq!(metrics.successes.load(Ordering::SeqCst), 1);

        let failing_metrics = Arc::new(CountingMetrics::default());
        let router = Arc::new(ModelRouter::new(SelectionStrategy::Random));
        router.register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);
        let failing = ProviderOrchestrator::new(
            vec![StubProvider::failing("openai")],
            router,
            Arc::new(MemoryCache::new()),
            failing_metrics.clone(),
            quick_settings(),
        );

        assert!(failing.execute_stream(&request()).await.is_err());
        assert_eq!(failing_metrics.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_routes_and_records() {
        let provider = StubProvider::ok("openai");
        let orchestrator = orchestrator_with(vec![provider], SelectionStrategy::Random);
        orchestrator
            .router()
            .register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);

        let deltas = orchestrator.execute_stream(&request()).await.unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(orchestrator.router().metrics_snapshot()[0].total_requests, 1);
    }

    #[tokio::test]
    async fn test_health_snapshot_probes_every_provider() {
        let up = StubProvider::ok("openai");
        let down = StubProvider::failing("anthropic");
        let orchestrator = orchestrator_with(vec![up, down], SelectionStrategy::Random);

        let snapshot = orchestrator.health_snapshot().await;
        assert_eq!(snapshot.get("openai"), Some(&true));
        assert_eq!(snapshot.get("anthropic"), Some(&false));
    }

    #[tokio::test]
    async fn test_breaker_stats_visible_per_provider() {
        let provider = StubProvider::ok("openai");
        let orchestrator = orchestrator_with(vec![provider], SelectionStrategy::Random);
        assert!(orchestrator.breaker_stats("openai").is_some());
        assert!(orchestrator.breaker_stats("unknown").is_none());
    }
}
