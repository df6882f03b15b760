//! Response cache boundary
//!
//! A cache hit short-circuits the whole orchestration path: routing,
//! breakers, and provider calls are all bypassed. Caching is an
//! optimization, never a correctness requirement, so write failures are
//! swallowed and logged by the caller.

use crate::error::GatewayResult;
use crate::provider::{ChatRequest, GatewayResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Key for a cacheable request, scoped to tenant and model so tenants
/// never see each other's responses
pub fn cache_key(request: &ChatRequest) -> String {
    let mut hasher = DefaultHasher::new();
    for message in &request.messages {
        message.role.hash(&mut hasher);
        message.content.hash(&mut hasher);
    }
    request.temperature.map(|t| t.to_bits()).hash(&mut hasher);
    request.max_tokens.hash(&mut hasher);
    format!(
        "{}:{}:{:x}",
        request.tenant_id,
        request.model.as_deref().unwrap_or("auto"),
        hasher.finish()
    )
}

/// Async cache store the orchestrator consults before routing
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a cached response; `None` on miss or expiry
    async fn get(&self, key: &str) -> Option<GatewayResponse>;

    /// Store a response with a time-to-live
    async fn set(&self, key: &str, value: GatewayResponse, ttl: Duration) -> GatewayResult<()>;
}

/// In-process cache with lazy TTL expiry
///
/// Expired entries are dropped on read and swept opportunistically on
/// write.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (GatewayResponse, Instant)>>,
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live (possibly expired but unswept) entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<GatewayResponse> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Some(value.clone()),
            _ => None,
        }
    }

    async fn set(&self, key: &str, value: GatewayResponse, ttl: Duration) -> GatewayResult<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }
}
