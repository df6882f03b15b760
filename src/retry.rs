//! Bounded-attempt retry with exponential backoff
//!
//! Wraps an arbitrary asynchronous operation and re-runs it on transient
//! failures, with exponential (optionally jittered) spacing between
//! attempts. Retries are strictly sequential; there is never a parallel
//! speculative attempt.

use crate::error::{GatewayError, GatewayResult};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};

/// Backoff policy for a retry handler
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total invocations, including the first attempt
    pub max_attempts: u32,
    /// Base wait before the first retry
    pub min_wait: Duration,
    /// Ceiling on any single wait
    pub max_wait: Duration,
    /// Exponential growth factor; 1.0 gives fixed spacing
    pub multiplier: f64,
    /// Full jitter: sample each wait uniformly from [0, wait]
    pub jitter: bool,
}

impl RetryPolicy {
    /// Exponential backoff with full jitter (multiplier 2)
    pub fn with_exponential_backoff(max_attempts: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            min_wait,
            max_wait,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Fixed spacing between attempts (multiplier 1, no jitter)
    pub fn with_linear_backoff(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts,
            min_wait: wait,
            max_wait: wait,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Wait before the retry following `attempt` (1-based)
    ///
    /// `wait = min(max_wait, min_wait * multiplier^(attempt-1))`, jittered
    /// down to a uniform sample of [0, wait] when enabled.
    pub fn wait_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let wait = self.min_wait.as_secs_f64() * exp;
        let capped = wait.min(self.max_wait.as_secs_f64());
        let secs = if self.jitter && capped > 0.0 {
            rand::rng().random_range(0.0..=capped)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_exponential_backoff(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Executes operations under a [`RetryPolicy`], optionally bounded by an
/// external deadline
///
/// The deadline is checked between attempts, caps every backoff sleep,
/// and bounds each in-flight attempt, so a caller-imposed timeout is
/// honored even against a hung operation.
pub struct RetryHandler {
    policy: RetryPolicy,
    deadline: Option<Instant>,
}

impl RetryHandler {
    /// Create a handler with no external deadline
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            deadline: None,
        }
    }

    /// Bound all attempts and backoff sleeps by an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The policy this handler runs under
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` up to `max_attempts` times
    ///
    /// On final failure the original error is returned, never a wrapper.
    pub async fn execute<T, F, Fut>(&self, op: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.execute_with_callback(op, |_, _| {}).await
    }

    /// Run `op` with a callback invoked before each retry
    ///
    /// `on_retry(err, attempt)` fires after a failed attempt when another
    /// attempt will follow; it does not fire for the final failure.
    pub async fn execute_with_callback<T, F, Fut, C>(
        &self,
        mut op: F,
        mut on_retry: C,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
        C: FnMut(&GatewayError, u32),
    {
        let started = Instant::now();
        for attempt in 1..=self.policy.max_attempts {
            if let Some(deadline) = self.deadline
                && Instant::now() >= deadline
            {
                return Err(GatewayError::DeadlineExceeded {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }

            // A deadline bounds the in-flight attempt too: a hung provider
            // call is abandoned, not awaited to completion.
            let outcome = match self.deadline {
                Some(deadline) => {
                    let budget = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(budget, op()).await {
                        Ok(result) => result,
                        Err(_) => {
                            return Err(GatewayError::DeadlineExceeded {
                                elapsed_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                    }
                }
                None => op().await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let wait = self.bounded_wait(attempt);
                    tracing::debug!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Attempt failed, backing off before retry"
                    );
                    on_retry(&err, attempt);
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }

        // max_attempts >= 1 means the loop always returns before this point
        Err(GatewayError::Internal(
            "retry loop exited without an outcome".to_string(),
        ))
    }

    /// Backoff wait for `attempt`, clipped so it never sleeps past the
    /// deadline
    fn bounded_wait(&self, attempt: u32) -> Duration {
        let wait = self.policy.wait_for_attempt(attempt);
        match self.deadline {
            Some(deadline) => wait.min(deadline.saturating_duration_since(Instant::now())),
            None => wait,
        }
    }
}
