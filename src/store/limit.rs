//! Fetch concurrency limiting and retry backoff
//!
//! Backing store fetches may hit the network. A semaphore bounds how many
//! run at once; transient failures are retried with exponential backoff.

use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Bounds the number of concurrent backing store fetches
pub struct FetchLimiter {
    concurrency: Semaphore,
    max_concurrent: usize,
}

impl FetchLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        FetchLimiter {
            concurrency: Semaphore::new(max_concurrent),
            max_concurrent,
        }
    }

    /// Wait for a fetch slot
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.concurrency
            .acquire()
            .await
            .map_err(|_| Error::Internal("fetch limiter closed".to_string()))
    }

    /// Slots not currently in use
    pub fn available(&self) -> usize {
        self.concurrency.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// Exponential backoff helper
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    current_attempt: u32,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        ExponentialBackoff {
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_secs(30),
            max_attempts,
            current_attempt: 0,
            jitter: false,
        }
    }

    /// Spread retries by up to +50% of each delay
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Get the next delay, or None if max attempts reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }

        let delay = self.base_delay * 2u32.saturating_pow(self.current_attempt);
        self.current_attempt += 1;

        let delay = delay.min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
            Some(delay + Duration::from_millis(extra))
        } else {
            Some(delay)
        }
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn has_attempts(&self) -> bool {
        self.current_attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limiter_bounds_concurrency() {
        let limiter = FetchLimiter::new(2);

        let _g1 = limiter.acquire().await.unwrap();
        let _g2 = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);

        let third = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(third.is_err());
    }

    #[test]
    fn test_zero_parallelism_is_clamped() {
        assert_eq!(FetchLimiter::new(0).max_concurrent(), 1);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(100, 3);

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = ExponentialBackoff::new(100, 1).with_jitter();
        let delay = backoff.next_delay().unwrap();
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(100, 2);

        backoff.next_delay();
        backoff.next_delay();
        assert!(!backoff.has_attempts());

        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }
}
