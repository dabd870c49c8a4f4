//! Per-Domain Rate Limiting
//!
//! One token bucket per source domain, shared by every in-flight fetch:
//! - Capacity `burst`, refilled at `per_second` tokens per second
//! - `acquire` suspends the caller until its domain has a token
//! - Domains are independent; a slow domain never blocks another
//!
//! Buckets are created lazily and dropped by [`DomainRateLimiter::gc`] once
//! they are full again.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use tracing::{debug, trace};

/// Token-bucket limits for a single domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second
    pub per_second: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            burst: 10,
        }
    }
}

impl RateLimitConfig {
    fn quota(&self) -> Quota {
        let rate = NonZeroU32::new(self.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst).unwrap_or(rate);
        Quota::per_second(rate).allow_burst(burst)
    }
}

/// Keyed limiter shared across all workers
pub struct DomainRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl DomainRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::keyed(config.quota()),
        }
    }

    /// Waits until a token is available for `domain`, then consumes it.
    pub async fn acquire(&self, domain: &str) {
        let key = domain.to_string();
        if self.limiter.check_key(&key).is_ok() {
            return;
        }
        trace!(domain = %domain, "Rate limited, waiting for token");
        self.limiter.until_key_ready(&key).await;
    }

    /// Non-blocking variant; returns whether a token was taken.
    pub fn try_acquire(&self, domain: &str) -> bool {
        self.limiter.check_key(&domain.to_string()).is_ok()
    }

    /// Drops buckets that have refilled completely.
    pub fn gc(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(
            before = before,
            after = self.limiter.len(),
            "Rate limiter buckets collected"
        );
    }

    /// Number of domains currently holding a bucket
    pub fn tracked_domains(&self) -> usize {
        self.limiter.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_burst_then_empty() {
        let limiter = DomainRateLimiter::new(RateLimitConfig {
            per_second: 1,
            burst: 3,
        });

        assert!(limiter.try_acquire("example.com"));
        assert!(limiter.try_acquire("example.com"));
        assert!(limiter.try_acquire("example.com"));
        assert!(!limiter.try_acquire("example.com"));
    }

    #[test]
    fn test_domains_are_independent() {
        let limiter = DomainRateLimiter::new(RateLimitConfig {
            per_second: 1,
            burst: 1,
        });

        assert!(limiter.try_acquire("a.example"));
        assert!(!limiter.try_acquire("a.example"));
        assert!(limiter.try_acquire("b.example"));
        assert_eq!(limiter.tracked_domains(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = DomainRateLimiter::new(RateLimitConfig {
            per_second: 5,
            burst: 1,
        });

        let start = Instant::now();
        limiter.acquire("slow.example").await;
        limiter.acquire("slow.example").await;
        limiter.acquire("slow.example").await;

        // two refills at 200ms each
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_zero_config_falls_back_to_minimum() {
        let limiter = DomainRateLimiter::new(RateLimitConfig {
            per_second: 0,
            burst: 0,
        });
        assert!(limiter.try_acquire("x.example"));
    }
}
