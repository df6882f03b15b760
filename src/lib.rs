//! modelgate - provider-request orchestration for a multi-tenant AI gateway
//!
//! Provides the resilience core that sits between a gateway's API surface
//! and its upstream model providers: strategy-driven model routing with
//! per-model health scores, per-provider circuit breaking, bounded retries
//! with jittered backoff, tenant token-bucket rate limiting, an optional
//! primary/secondary fallback pairing, and TTL response caching.
//!
//! [`orchestrator::ProviderOrchestrator`] is the entry point; everything
//! else is usable on its own.
//!
//! # Example
//!
//! ```no_run
//! use modelgate::cache::MemoryCache;
//! use modelgate::config::GatewayConfig;
//! use modelgate::metrics::PrometheusMetrics;
//! use modelgate::orchestrator::ProviderOrchestrator;
//! use modelgate::provider::{ChatMessage, ChatRequest};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::from_file("gateway.toml")?;
//! modelgate::telemetry::init(&config.observability.log_level);
//!
//! let metrics = Arc::new(PrometheusMetrics::new()?);
//! let orchestrator =
//!     ProviderOrchestrator::from_config(&config, Arc::new(MemoryCache::new()), metrics)?;
//!
//! let request = ChatRequest {
//!     messages: vec![ChatMessage::user("Summarize this document")],
//!     model: None,
//!     temperature: None,
//!     max_tokens: Some(512),
//!     stream: false,
//!     tenant_id: "acme".to_string(),
//! };
//! let response = orchestrator.execute(&request).await?;
//! println!("{} answered: {}", response.provider, response.content);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod ratelimit;
pub mod retry;
pub mod router;
pub mod telemetry;

pub use error::{GatewayError, GatewayResult};
pub use orchestrator::{OrchestratorConfig, ProviderOrchestrator};
pub use provider::{ChatMessage, ChatRequest, GatewayResponse, ProviderClient};
pub use router::SelectionStrategy;
