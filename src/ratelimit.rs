//! Token bucket rate limiting
//!
//! Buckets refill continuously based on elapsed time; refill is lazy,
//! computed on access rather than by a background timer. The gateway keys
//! buckets by tenant and endpoint.

use crate::metrics::MetricsSink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuously refilling token bucket
///
/// Invariant: `0 <= tokens <= capacity` at every observable point. The
/// lock covers only the refill-and-decide read-modify-write.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    ///
    /// `refill_rate` is tokens per second.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Atomically refill, then consume `n` tokens if available
    ///
    /// Returns false without draining anything when fewer than `n` tokens
    /// are present. `last_refill` advances in both cases.
    pub fn consume(&self, n: f64) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Seconds until `needed` tokens will be available, zero if they
    /// already are
    pub fn time_until_refill(&self, needed: f64) -> Duration {
        let state = self.state.lock().expect("bucket lock poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        let current = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        if current >= needed {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((needed - current) / self.refill_rate)
    }

    /// Currently available tokens (after a provisional refill)
    pub fn available(&self) -> f64 {
        let state = self.state.lock().expect("bucket lock poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.refill_rate).min(self.capacity)
    }
}

/// Per-key rate limiter backed by token buckets
///
/// Keys are `tenant:endpoint` pairs; each key gets its own bucket created
/// on first use. Exceedances are reported to the metrics sink.
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    /// Create a limiter where every key gets `capacity` tokens refilling
    /// at `refill_rate` per second
    pub fn new(capacity: f64, refill_rate: f64, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Consume one token for the tenant/endpoint pair
    ///
    /// Returns false, and records the exceedance, when the bucket is
    /// empty.
    pub fn check(&self, tenant: &str, endpoint: &str) -> bool {
        let bucket = self.bucket_for(tenant, endpoint);
        let allowed = bucket.consume(1.0);
        if !allowed {
            tracing::debug!(tenant, endpoint, "Rate limit exceeded");
            self.metrics.record_rate_limit_exceeded(tenant, endpoint);
        }
        allowed
    }

    /// How long the tenant/endpoint pair must wait for one token
    pub fn retry_after(&self, tenant: &str, endpoint: &str) -> Duration {
        self.bucket_for(tenant, endpoint).time_until_refill(1.0)
    }

    fn bucket_for(&self, tenant: &str, endpoint: &str) -> Arc<TokenBucket> {
        let key = format!("{tenant}:{endpoint}");
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        buckets
            .entry(key)
            .or_insert_with(|| Arc::new(TokenBucket::new(self.capacity, self.refill_rate)))
            .clone()
    }
}
