//! Token-bucket rate limiting, keyed by `(scope, key)`.
//!
//! One bucket per cluster/limit pair, refilled continuously against a
//! monotonic `quanta` clock. Callers that are refused sleep a small quantum
//! and retry inside their own wait budget.

use std::collections::HashMap;
use std::sync::Mutex;

use quanta::{Clock, Instant};

struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, burst: f64, now: Instant) -> Self {
        Self {
            rate_per_sec,
            burst,
            tokens: burst,
            last_refill: now,
        }
    }

    fn allow_n(&mut self, n: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiterRegistry {
    clock: Clock,
    buckets: Mutex<HashMap<(String, String), TokenBucket>>,
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// One token from the `(scope, key)` bucket refilled at `per_second`.
    pub fn allow(&self, scope: &str, key: &str, per_second: u64) -> bool {
        self.allow_n(scope, key, per_second, 1)
    }

    /// `n` tokens at once; used for byte-rate limits.
    pub fn allow_n(&self, scope: &str, key: &str, per_second: u64, n: u64) -> bool {
        if per_second == 0 {
            return true;
        }
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().expect("rate lock");
        let bucket = buckets
            .entry((scope.to_string(), key.to_string()))
            .or_insert_with(|| TokenBucket::new(per_second as f64, per_second as f64, now));
        bucket.allow_n(n as f64, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_refusal() {
        let registry = RateLimiterRegistry::new();
        let mut allowed = 0;
        for _ in 0..20 {
            if registry.allow("c1", "req-max_qps", 10) {
                allowed += 1;
            }
        }
        // Full burst passes, then the bucket is dry.
        assert!(allowed >= 10);
        assert!(allowed < 20);
    }

    #[test]
    fn zero_rate_means_unlimited() {
        let registry = RateLimiterRegistry::new();
        for _ in 0..1000 {
            assert!(registry.allow("c1", "req-max_qps", 0));
        }
    }

    #[test]
    fn byte_budget_consumed_in_chunks() {
        let registry = RateLimiterRegistry::new();
        assert!(registry.allow_n("c1", "req-max_bps", 1000, 600));
        assert!(!registry.allow_n("c1", "req-max_bps", 1000, 600));
    }
}
