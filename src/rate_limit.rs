//! Token-bucket rate limiter shared across capture workers
//!
//! Protects the external fetch API from bursts. The bucket is the only
//! cross-worker shared-write resource in the process, so its accounting sits
//! behind a single async mutex.

use crate::config::RateLimitConfig;
use crate::error::CaptureError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    permits_per_second: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.burst.max(1) as f64;
        Self {
            permits_per_second: config.permits_per_second.max(0.01),
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one permit immediately if available.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a permit is available or the timeout elapses.
    ///
    /// A timed-out acquire is a transient failure: the caller retries the
    /// whole item later rather than holding a worker slot.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), CaptureError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.try_acquire().await {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CaptureError::RateLimitTimeout(timeout));
            }
            // Sleep roughly until the next token, bounded by the deadline.
            let until_token = Duration::from_secs_f64(1.0 / self.permits_per_second);
            let wait = until_token.min(deadline - now).min(Duration::from_millis(200));
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available, for diagnostics.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.permits_per_second).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(permits_per_second: f64, burst: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            permits_per_second,
            burst,
            acquire_timeout: Duration::from_secs(30),
        })
    }

    #[tokio::test]
    async fn burst_then_blocked() {
        let limiter = limiter(1.0, 5);

        for _ in 0..5 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn acquire_times_out_when_starved() {
        let limiter = limiter(0.1, 1);
        assert!(limiter.try_acquire().await);

        let result = limiter.acquire(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CaptureError::RateLimitTimeout(_))));
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = limiter(100.0, 2);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn acquire_succeeds_after_refill() {
        let limiter = limiter(50.0, 1);
        assert!(limiter.try_acquire().await);
        assert!(limiter.acquire(Duration::from_secs(1)).await.is_ok());
    }
}
