//! Configuration management for modelgate
//!
//! Parses TOML configuration files and provides typed access to settings.
//! Validation happens once at load; construction of the orchestrator from
//! an invalid config is impossible.

use crate::error::{GatewayError, GatewayResult};
use crate::router::SelectionStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub orchestrator: OrchestratorSettings,
    /// Registered provider/model pairs
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub ratelimit: RateLimitSettings,
    #[serde(default)]
    pub fallback: Option<FallbackSettings>,
    #[serde(default)]
    pub observability: ObservabilitySettings,
}

/// Orchestrator-level settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorSettings {
    pub strategy: SelectionStrategy,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Whole-call deadline; requests exceeding it are abandoned
    #[serde(default)]
    pub request_deadline_seconds: Option<u64>,
    /// How many distinct candidates one request may try before giving up
    #[serde(default = "default_max_route_attempts")]
    pub max_route_attempts: usize,
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_max_route_attempts() -> usize {
    3
}

/// One registered provider/model pair with its scoring weights
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEntry {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub cost_per_token: f64,
    #[serde(default = "default_quality_score")]
    pub quality_score: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_quality_score() -> f64 {
    0.5
}

fn default_weight() -> f64 {
    1.0
}

/// Circuit breaker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_seconds() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    3
}

/// Retry settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            jitter: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_wait_ms() -> u64 {
    500
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// Gateway-side tenant rate limiting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_burst")]
    pub burst: f64,
    /// Tokens per second restored to each tenant bucket
    #[serde(default = "default_per_second")]
    pub per_second: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: default_burst(),
            per_second: default_per_second(),
        }
    }
}

fn default_burst() -> f64 {
    20.0
}

fn default_per_second() -> f64 {
    5.0
}

/// Optional primary/secondary failover pairing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackSettings {
    /// Provider name of the primary (must be a registered provider)
    pub primary: String,
    /// Provider name of the secondary
    pub secondary: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_reset_timeout_seconds")]
    pub circuit_reset_timeout_seconds: u64,
}

fn default_retry_count() -> u32 {
    3
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout_seconds() -> u64 {
    60
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilitySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants serde cannot express
    pub fn validate(&self) -> GatewayResult<()> {
        if self.providers.is_empty() {
            return Err(GatewayError::Config(
                "at least one [[providers]] entry is required".to_string(),
            ));
        }
        for entry in &self.providers {
            if entry.provider.trim().is_empty() || entry.model.trim().is_empty() {
                return Err(GatewayError::Config(
                    "provider and model names must not be empty".to_string(),
                ));
            }
            if entry.cost_per_token < 0.0 {
                return Err(GatewayError::Config(format!(
                    "cost_per_token must be non-negative for {}:{}, got {}",
                    entry.provider, entry.model, entry.cost_per_token
                )));
            }
        }
        if self.breaker.failure_threshold == 0 {
            return Err(GatewayError::Config(
                "breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.breaker.half_open_max_calls == 0 {
            return Err(GatewayError::Config(
                "breaker.half_open_max_calls must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(GatewayError::Config(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.retry.min_wait_ms > self.retry.max_wait_ms {
            return Err(GatewayError::Config(format!(
                "retry.min_wait_ms ({}) exceeds retry.max_wait_ms ({})",
                self.retry.min_wait_ms, self.retry.max_wait_ms
            )));
        }
        if self.orchestrator.max_route_attempts == 0 {
            return Err(GatewayError::Config(
                "orchestrator.max_route_attempts must be greater than 0".to_string(),
            ));
        }
        if let Some(fb) = &self.fallback {
            for name in [&fb.primary, &fb.secondary] {
                if !self.providers.iter().any(|p| &p.provider == name) {
                    return Err(GatewayError::Config(format!(
                        "fallback references unknown provider {name}"
                    )));
                }
            }
            if fb.primary == fb.secondary {
                return Err(GatewayError::Config(
                    "fallback primary and secondary must differ".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Cache TTL as a duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.orchestrator.cache_ttl_seconds)
    }

    /// Whole-call deadline, if configured
    pub fn request_deadline(&self) -> Option<Duration> {
        self.orchestrator
            .request_deadline_seconds
            .map(Duration::from_secs)
    }
}
