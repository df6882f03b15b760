//! Score-based routing across registered provider/model pairs
//!
//! The router owns per-model metrics and selects a candidate according to
//! the configured strategy. Success and failure outcomes feed back into
//! the scores, and models whose observed success rate collapses are
//! automatically quarantined.

use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

/// Selection strategy for choosing among available candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    Random,
    LeastLatency,
    Weighted,
    CostOptimized,
    QualityOptimized,
}

impl SelectionStrategy {
    /// Label for logging and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastLatency => "least_latency",
            Self::Weighted => "weighted",
            Self::CostOptimized => "cost_optimized",
            Self::QualityOptimized => "quality_optimized",
        }
    }
}

/// Observed and registered metrics for one provider/model pair
///
/// Created at registration, mutated by outcome recording, never deleted.
#[derive(Debug, Clone)]
pub struct ModelMetrics {
    pub provider: String,
    pub model: String,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Accumulated latency in seconds across successful requests
    pub total_latency: f64,
    pub avg_latency: f64,
    /// `(total - failed) / total`; 1.0 before any traffic
    pub success_rate: f64,
    pub cost_per_token: f64,
    pub quality_score: f64,
    pub last_used: Option<Instant>,
    pub is_available: bool,
}

impl ModelMetrics {
    fn new(provider: &str, model: &str, cost_per_token: f64, quality_score: f64) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            total_requests: 0,
            failed_requests: 0,
            total_latency: 0.0,
            avg_latency: 0.0,
            success_rate: 1.0,
            cost_per_token,
            quality_score,
            last_used: None,
            is_available: true,
        }
    }

    fn recompute_success_rate(&mut self) {
        if self.total_requests > 0 {
            self.success_rate =
                (self.total_requests - self.failed_requests) as f64 / self.total_requests as f64;
        }
    }

    /// Registry key, `"provider:model"`
    pub fn key(&self) -> String {
        model_key(&self.provider, &self.model)
    }
}

/// Registry key for a provider/model pair
pub fn model_key(provider: &str, model: &str) -> String {
    format!("{provider}:{model}")
}

/// Success rate below which a model with meaningful traffic is quarantined
const QUARANTINE_SUCCESS_RATE: f64 = 0.5;
/// Minimum requests before the quarantine rule applies
const QUARANTINE_MIN_REQUESTS: u64 = 10;

struct RouterState {
    // BTreeMap keeps candidate iteration order deterministic, so
    // strategies resolve ties the same way on every call.
    entries: BTreeMap<String, ModelMetrics>,
    weights: HashMap<String, f64>,
    round_robin_counter: usize,
}

/// Selects a (provider, model) pair per strategy and records outcomes
///
/// A single coarse lock covers selection plus bookkeeping; critical
/// sections are short and never span a provider call.
pub struct ModelRouter {
    strategy: SelectionStrategy,
    state: Mutex<RouterState>,
}

impl ModelRouter {
    /// Create an empty router with the given strategy
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(RouterState {
                entries: BTreeMap::new(),
                weights: HashMap::new(),
                round_robin_counter: 0,
            }),
        }
    }

    /// The strategy this router selects with
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Register a provider/model pair with its static scoring weights
    ///
    /// Re-registering an existing pair resets its metrics.
    pub fn register_model(
        &self,
        provider: &str,
        model: &str,
        cost_per_token: f64,
        quality_score: f64,
        weight: f64,
    ) {
        let key = model_key(provider, model);
        let mut state = self.state.lock().expect("router lock poisoned");
        tracing::info!(
            provider,
            model,
            cost_per_token,
            quality_score,
            weight,
            "Registered model"
        );
        state.entries.insert(
            key.clone(),
            ModelMetrics::new(provider, model, cost_per_token, quality_score),
        );
        state.weights.insert(key, weight);
    }

    /// Select an available (provider, model) pair, skipping `excluded` keys
    ///
    /// Returns `None` when no candidate is available. Round-robin fairness
    /// is approximate: the counter advances over the *current* filtered
    /// list, which can shrink or grow between calls as models are
    /// quarantined and recovered.
    pub fn select_model(&self, excluded: &HashSet<String>) -> Option<(String, String)> {
        let mut state = self.state.lock().expect("router lock poisoned");

        let candidates: Vec<String> = state
            .entries
            .values()
            .filter(|m| m.is_available && !excluded.contains(&m.key()))
            .map(|m| m.key())
            .collect();

        if candidates.is_empty() {
            tracing::warn!(
                registered = state.entries.len(),
                excluded = excluded.len(),
                "No available model candidates"
            );
            return None;
        }

        let chosen_key = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let index = state.round_robin_counter % candidates.len();
                state.round_robin_counter = state.round_robin_counter.wrapping_add(1);
                candidates[index].clone()
            }
            SelectionStrategy::Random => {
                let index = rand::rng().random_range(0..candidates.len());
                candidates[index].clone()
            }
            SelectionStrategy::LeastLatency => Self::least_latency(&state, &candidates),
            SelectionStrategy::Weighted => Self::weighted(&state, &candidates),
            SelectionStrategy::CostOptimized => candidates
                .iter()
                .min_by(|a, b| {
                    let ca = state.entries[*a].cost_per_token;
                    let cb = state.entries[*b].cost_per_token;
                    ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
                })?
                .clone(),
            SelectionStrategy::QualityOptimized => candidates
                .iter()
                .max_by(|a, b| {
                    let qa = state.entries[*a].quality_score;
                    let qb = state.entries[*b].quality_score;
                    qa.partial_cmp(&qb).unwrap_or(std::cmp::Ordering::Equal)
                })?
                .clone(),
        };

        let entry = &state.entries[&chosen_key];
        tracing::debug!(
            provider = %entry.provider,
            model = %entry.model,
            strategy = self.strategy.as_str(),
            candidates = candidates.len(),
            "Selected model"
        );
        Some((entry.provider.clone(), entry.model.clone()))
    }

    /// Minimum average latency; ties (including the zero-latency ties that
    /// never-used models produce) break toward the most recently used
    /// candidate, with never-used models losing to any used one.
    fn least_latency(state: &RouterState, candidates: &[String]) -> String {
        let mut best = candidates[0].clone();
        for key in &candidates[1..] {
            let current = &state.entries[key];
            let incumbent = &state.entries[&best];
            let better = match current
                .avg_latency
                .partial_cmp(&incumbent.avg_latency)
                .unwrap_or(std::cmp::Ordering::Equal)
            {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => match (current.last_used, incumbent.last_used) {
                    (Some(a), Some(b)) => a > b,
                    (Some(_), None) => true,
                    _ => false,
                },
            };
            if better {
                best = key.clone();
            }
        }
        best
    }

    /// Cumulative-weight sampling over registered weights, with a uniform
    /// fallback when the total weight is zero or negative.
    fn weighted(state: &RouterState, candidates: &[String]) -> String {
        let total_weight: f64 = candidates
            .iter()
            .map(|k| state.weights.get(k).copied().unwrap_or(1.0))
            .sum();

        let mut rng = rand::rng();
        if total_weight <= 0.0 {
            tracing::warn!(
                total_weight,
                candidates = candidates.len(),
                "Non-positive total weight, falling back to uniform selection"
            );
            let index = rng.random_range(0..candidates.len());
            return candidates[index].clone();
        }

        let sample = rng.random_range(0.0..total_weight);
        let mut cumulative = 0.0;
        for key in candidates {
            cumulative += state.weights.get(key).copied().unwrap_or(1.0);
            if sample < cumulative {
                return key.clone();
            }
        }
        // Float precision fallback
        candidates[candidates.len() - 1].clone()
    }

    /// Record a successful call with its latency in seconds
    pub fn record_success(&self, provider: &str, model: &str, latency_secs: f64) {
        let key = model_key(provider, model);
        let mut state = self.state.lock().expect("router lock poisoned");
        let Some(entry) = state.entries.get_mut(&key) else {
            tracing::warn!(provider, model, "record_success for unregistered model");
            return;
        };
        entry.total_requests += 1;
        entry.total_latency += latency_secs;
        entry.avg_latency = entry.total_latency / entry.total_requests as f64;
        entry.recompute_success_rate();
        entry.last_used = Some(Instant::now());
    }

    /// Record a failed call
    ///
    /// Applies the quarantine policy: success rate below 0.5 with more
    /// than 10 recorded requests marks the model unavailable.
    pub fn record_failure(&self, provider: &str, model: &str) {
        let key = model_key(provider, model);
        let mut state = self.state.lock().expect("router lock poisoned");
        let Some(entry) = state.entries.get_mut(&key) else {
            tracing::warn!(provider, model, "record_failure for unregistered model");
            return;
        };
        entry.total_requests += 1;
        entry.failed_requests += 1;
        entry.recompute_success_rate();
        if entry.success_rate < QUARANTINE_SUCCESS_RATE
            && entry.total_requests > QUARANTINE_MIN_REQUESTS
            && entry.is_available
        {
            tracing::warn!(
                provider,
                model,
                success_rate = entry.success_rate,
                total_requests = entry.total_requests,
                "Model quarantined due to poor success rate"
            );
            entry.is_available = false;
        }
    }

    /// Manually mark a model available, clearing quarantine
    pub fn mark_available(&self, provider: &str, model: &str) {
        self.set_availability(provider, model, true);
    }

    /// Manually mark a model unavailable
    pub fn mark_unavailable(&self, provider: &str, model: &str) {
        self.set_availability(provider, model, false);
    }

    fn set_availability(&self, provider: &str, model: &str, available: bool) {
        let key = model_key(provider, model);
        let mut state = self.state.lock().expect("router lock poisoned");
        if let Some(entry) = state.entries.get_mut(&key) {
            if entry.is_available != available {
                tracing::info!(provider, model, available, "Model availability changed");
            }
            entry.is_available = available;
        }
    }

    /// Registered cost per token for a pair, used for cost accounting
    pub fn cost_per_token(&self, provider: &str, model: &str) -> Option<f64> {
        let key = model_key(provider, model);
        let state = self.state.lock().expect("router lock poisoned");
        state.entries.get(&key).map(|e| e.cost_per_token)
    }

    /// Zero all counters and restore availability across every entry
    pub fn reset_metrics(&self) {
        let mut state = self.state.lock().expect("router lock poisoned");
        tracing::info!(entries = state.entries.len(), "Resetting all model metrics");
        for entry in state.entries.values_mut() {
            entry.total_requests = 0;
            entry.failed_requests = 0;
            entry.total_latency = 0.0;
            entry.avg_latency = 0.0;
            entry.success_rate = 1.0;
            entry.last_used = None;
            entry.is_available = true;
        }
        state.round_robin_counter = 0;
    }

    /// Snapshot of all entries for observability
    pub fn metrics_snapshot(&self) -> Vec<ModelMetrics> {
        let state = self.state.lock().expect("router lock poisoned");
        state.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_model_router(strategy: SelectionStrategy) -> ModelRouter {
        let router = ModelRouter::new(strategy);
        router.register_model("openai", "gpt-3.5", 0.002, 0.8, 1.0);
        router.register_model("anthropic", "haiku", 0.00025, 0.75, 1.0);
        router
    }

    #[test]
    fn test_register_and_snapshot() {
        let router = two_model_router(SelectionStrategy::Random);
        let snapshot = router.metrics_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|m| m.is_available));
        assert!(snapshot.iter().all(|m| m.total_requests == 0));
    }

    #[test]
    fn test_select_returns_none_when_empty() {
        let router = ModelRouter::new(SelectionStrategy::Random);
        assert!(router.select_model(&HashSet::new()).is_none());
    }

    #[test]
    fn test_select_respects_exclusion() {
        let router = two_model_router(SelectionStrategy::Random);
        let mut excluded = HashSet::new();
        excluded.insert(model_key("openai", "gpt-3.5"));

        for _ in 0..20 {
            let (provider, model) = router.select_model(&excluded).unwrap();
            assert_eq!((provider.as_str(), model.as_str()), ("anthropic", "haiku"));
        }

        excluded.insert(model_key("anthropic", "haiku"));
        assert!(router.select_model(&excluded).is_none());
    }

    #[test]
    fn test_round_robin_cycles_over_candidates() {
        let router = two_model_router(SelectionStrategy::RoundRobin);
        let none = HashSet::new();
        let first = router.select_model(&none).unwrap();
        let second = router.select_model(&none).unwrap();
        let third = router.select_model(&none).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_cost_optimized_prefers_cheapest() {
        let router = two_model_router(SelectionStrategy::CostOptimized);
        let (provider, model) = router.select_model(&HashSet::new()).unwrap();
        assert_eq!(provider, "anthropic");
        assert_eq!(model, "haiku");
    }

    #[test]
    fn test_quality_optimized_prefers_best_score() {
        let router = two_model_router(SelectionStrategy::QualityOptimized);
        let (provider, model) = router.select_model(&HashSet::new()).unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(model, "gpt-3.5");
    }

    #[test]
    fn test_least_latency_prefers_faster_model() {
        let router = two_model_router(SelectionStrategy::LeastLatency);
        router.record_success("openai", "gpt-3.5", 0.4);
        router.record_success("anthropic", "haiku", 1.2);

        let (provider, _) = router.select_model(&HashSet::new()).unwrap();
        assert_eq!(provider, "openai");
    }

    #[test]
    fn test_least_latency_tie_break_prefers_recently_used() {
        // Both entries report zero latency; the used one wins the tie.
        let router = two_model_router(SelectionStrategy::LeastLatency);
        router.record_success("anthropic", "haiku", 0.0);

        let (provider, _) = router.select_model(&HashSet::new()).unwrap();
        assert_eq!(provider, "anthropic");
    }

    #[test]
    fn test_weighted_selection_follows_weights() {
        let router = ModelRouter::new(SelectionStrategy::Weighted);
        router.register_model("openai", "gpt-3.5", 0.002, 0.8, 9.0);
        router.register_model("anthropic", "haiku", 0.00025, 0.75, 1.0);

        let mut openai = 0;
        for _ in 0..1000 {
            let (provider, _) = router.select_model(&HashSet::new()).unwrap();
            if provider == "openai" {
                openai += 1;
            }
        }
        // 9:1 ratio, allow generous deviation
        assert!(openai > 765, "openai selected {openai}/1000, expected ~900");
    }

    #[test]
    fn test_weighted_zero_total_falls_back_to_uniform() {
        let router = ModelRouter::new(SelectionStrategy::Weighted);
        router.register_model("openai", "gpt-3.5", 0.002, 0.8, 0.0);
        router.register_model("anthropic", "haiku", 0.00025, 0.75, 0.0);

        for _ in 0..10 {
            assert!(router.select_model(&HashSet::new()).is_some());
        }
    }

    #[test]
    fn test_record_success_round_trip() {
        let router = two_model_router(SelectionStrategy::Random);
        for _ in 0..3 {
            router.record_success("openai", "gpt-3.5", 2.0);
        }
        let snapshot = router.metrics_snapshot();
        let m = snapshot
            .iter()
            .find(|m| m.provider == "openai")
            .expect("registered");
        assert_eq!(m.total_requests, 3);
        assert!((m.avg_latency - 2.0).abs() < f64::EPSILON);
        assert!((m.success_rate - 1.0).abs() < f64::EPSILON);
        assert!(m.last_used.is_some());
    }

    #[test]
    fn test_quarantine_after_eleven_failures() {
        let router = two_model_router(SelectionStrategy::Random);
        for _ in 0..10 {
            router.record_failure("openai", "gpt-3.5");
        }
        // 10 failures of 10 requests: rate 0.0 but not past the minimum
        let m = &router.metrics_snapshot()[1];
        assert_eq!(m.provider, "openai");
        assert!(m.is_available);

        router.record_failure("openai", "gpt-3.5");
        let m = &router.metrics_snapshot()[1];
        assert!(!m.is_available);
        assert_eq!(m.total_requests, 11);
        assert_eq!(m.failed_requests, 11);
    }

    #[test]
    fn test_quarantined_model_not_selected() {
        let router = two_model_router(SelectionStrategy::Random);
        for _ in 0..11 {
            router.record_failure("openai", "gpt-3.5");
        }
        for _ in 0..20 {
            let (provider, _) = router.select_model(&HashSet::new()).unwrap();
            assert_eq!(provider, "anthropic");
        }
    }

    #[test]
    fn test_mark_available_overrides_quarantine() {
        let router = two_model_router(SelectionStrategy::Random);
        for _ in 0..11 {
            router.record_failure("openai", "gpt-3.5");
        }
        router.mark_available("openai", "gpt-3.5");
        let m = &router.metrics_snapshot()[1];
        assert!(m.is_available);
    }

    #[test]
    fn test_mark_unavailable() {
        let router = two_model_router(SelectionStrategy::Random);
        router.mark_unavailable("anthropic", "haiku");
        for _ in 0..10 {
            let (provider, _) = router.select_model(&HashSet::new()).unwrap();
            assert_eq!(provider, "openai");
        }
    }

    #[test]
    fn test_reset_metrics_restores_everything() {
        let router = two_model_router(SelectionStrategy::Random);
        for _ in 0..11 {
            router.record_failure("openai", "gpt-3.5");
        }
        router.record_success("anthropic", "haiku", 1.5);

        router.reset_metrics();
        for m in router.metrics_snapshot() {
            assert_eq!(m.total_requests, 0);
            assert_eq!(m.failed_requests, 0);
            assert_eq!(m.avg_latency, 0.0);
            assert!((m.success_rate - 1.0).abs() < f64::EPSILON);
            assert!(m.is_available);
            assert!(m.last_used.is_none());
        }
    }

    #[test]
    fn test_mixed_outcomes_success_rate() {
        let router = two_model_router(SelectionStrategy::Random);
        router.record_success("openai", "gpt-3.5", 1.0);
        router.record_success("openai", "gpt-3.5", 1.0);
        router.record_failure("openai", "gpt-3.5");
        let m = &router.metrics_snapshot()[1];
        assert_eq!(m.total_requests, 3);
        assert!((m.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_per_token_lookup() {
        let router = two_model_router(SelectionStrategy::Random);
        assert_eq!(router.cost_per_token("anthropic", "haiku"), Some(0.00025));
        assert_eq!(router.cost_per_token("nope", "nope"), None);
    }
}
