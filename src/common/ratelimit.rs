//! Token bucket limiter for state-store queries
//!
//! The watcher set blocks on volume-table changes in a loop; under heavy
//! churn every wake-up would immediately turn into another query. The
//! limiter caps that loop at a configured rate with a small burst.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Longest single wait handed out when the refill rate is too small to express
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Token bucket state
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    burst_size: u32,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(burst_size: u32, refill_rate: f64) -> Self {
        Self {
            tokens: burst_size as f64,
            last_refill: Instant::now(),
            burst_size,
            refill_rate,
        }
    }

    /// Try to consume a token. Returns the wait before a token is available.
    fn try_consume(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(self.retry_after())
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.burst_size as f64);
        self.last_refill = now;
    }

    fn retry_after(&self) -> Duration {
        let needed = 1.0 - self.tokens;
        Duration::try_from_secs_f64(needed / self.refill_rate).unwrap_or(MAX_RETRY_AFTER)
    }
}

/// Async rate limiter shared by the watcher set's query loop
#[derive(Debug)]
pub struct QueryLimiter {
    bucket: Mutex<TokenBucket>,
}

impl QueryLimiter {
    /// `per_second` must be positive; `burst` is clamped to at least 1.
    pub fn new(per_second: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(burst.max(1), per_second)),
        }
    }

    /// Wait until a query is allowed.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                bucket.try_consume()
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Non-blocking variant, used by tests and diagnostics.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.try_consume().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_limited() {
        let limiter = QueryLimiter::new(10.0, 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(110)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = QueryLimiter::new(4.0, 1);
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(240));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_rate_does_not_overflow() {
        let mut bucket = TokenBucket::new(1, f64::MIN_POSITIVE);
        assert!(bucket.try_consume().is_none());
        assert_eq!(bucket.try_consume(), Some(MAX_RETRY_AFTER));
    }
}
