//! Per-user rate limiting for mutation requests.
//!
//! Token bucket with configurable burst and refill rate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity
    pub burst: u32,
    /// Tokens refilled per second
    pub refill_rate: f64,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 30,
            refill_rate: 10.0,
            enabled: true,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_rate).min(f64::from(config.burst));
        self.last_refill = now;
    }

    fn retry_after(&self, config: &RateLimitConfig) -> Duration {
        if config.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        // Rates small enough to overflow a Duration mean "not any time soon"
        Duration::try_from_secs_f64((1.0 - self.tokens).max(0.0) / config.refill_rate)
            .unwrap_or(Duration::MAX)
    }
}

/// Buckets keyed by username, shared by all of a user's connections.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `user`, or report how long until one is available.
    pub fn check(&self, user: &str) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(user.to_string())
            .or_insert_with(|| Bucket::full(self.config.burst));
        bucket.refill(&self.config, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(bucket.retry_after(&self.config))
        }
    }

    /// Drop buckets that have refilled completely and sat idle.
    pub fn cleanup(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < max_idle);
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32, refill_rate: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            burst,
            refill_rate,
            enabled: true,
        })
    }

    #[test]
    fn test_allows_burst_then_limits() {
        let limiter = limiter(3, 0.5);
        for _ in 0..3 {
            assert!(limiter.check("alice").is_ok());
        }
        let retry = limiter.check("alice").unwrap_err();
        assert!(retry > Duration::ZERO);
    }

    #[test]
    fn test_tiny_rates_do_not_overflow() {
        let limiter = limiter(1, 1e-300);
        limiter.check("alice").unwrap();
        assert_eq!(limiter.check("alice").unwrap_err(), Duration::MAX);
    }

    #[test]
    fn test_users_have_separate_buckets() {
        let limiter = limiter(1, 0.1);
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("bob").is_ok());
        assert!(limiter.check("alice").is_err());
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn test_disabled_never_limits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 1,
            refill_rate: 0.0,
            enabled: false,
        });
        for _ in 0..100 {
            assert!(limiter.check("alice").is_ok());
        }
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_cleanup_drops_idle_buckets() {
        let limiter = limiter(1, 1.0);
        limiter.check("alice").unwrap();
        limiter.cleanup(Duration::ZERO);
        assert_eq!(limiter.tracked(), 0);
    }
}
