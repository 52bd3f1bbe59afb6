use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{Result, ThrottleBackend, ThrottleKey};
use crate::config::ThrottleLimits;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    updated_at: Instant,
}

impl Bucket {
    fn full(limits: &ThrottleLimits, now: Instant) -> Self {
        Self {
            tokens: limits.max_tokens,
            updated_at: now,
        }
    }

    /// Credit whole tokens earned since the last refill
    ///
    /// The refill timestamp only moves when more than one token was earned, so
    /// short waits keep accumulating elapsed time.
    fn refill(&mut self, limits: &ThrottleLimits, now: Instant) {
        let window = limits.window.as_duration().as_secs_f64();
        let elapsed = now.duration_since(self.updated_at).as_secs_f64();
        let earned = (elapsed / window * f64::from(limits.rate)).floor();

        if earned > 1.0 {
            let earned = earned.min(f64::from(limits.max_tokens)) as u32;
            self.tokens = self.tokens.saturating_add(earned).min(limits.max_tokens);
            self.updated_at = now;
        }
    }
}

/// In-process token buckets behind one async mutex
///
/// The lock is released while a caller backs off, so other keys keep moving.
pub struct MemoryThrottle {
    buckets: Mutex<HashMap<String, Bucket>>,
    backoff: Duration,
}

impl MemoryThrottle {
    pub fn new(backoff: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            backoff,
        }
    }

    /// Tokens left in a bucket, `None` if it was never used
    pub async fn tokens(&self, key: &ThrottleKey) -> Option<u32> {
        self.buckets
            .lock()
            .await
            .get(&key.to_string())
            .map(|bucket| bucket.tokens)
    }
}

#[async_trait]
impl ThrottleBackend for MemoryThrottle {
    async fn wait_for_token(&self, key: &ThrottleKey, limits: &ThrottleLimits) -> Result<u32> {
        let name = key.to_string();
        let mut waits = 0;

        loop {
            {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                let bucket = buckets
                    .entry(name.clone())
                    .or_insert_with(|| Bucket::full(limits, now));

                if bucket.tokens > 1 {
                    bucket.tokens -= 1;
                    return Ok(waits);
                }

                bucket.refill(limits, now);
            }

            waits += 1;
            debug!(key = %name, waits, "Token bucket empty, backing off");
            tokio::time::sleep(self.backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::HumanDuration;
    use std::sync::Arc;

    fn limits(window_secs: u64, rate: u32, max_tokens: u32) -> ThrottleLimits {
        ThrottleLimits {
            window: HumanDuration::from_secs(window_secs),
            rate,
            max_tokens,
        }
    }

    async fn timed_calls(
        throttle: &MemoryThrottle,
        key: &ThrottleKey,
        limits: &ThrottleLimits,
        calls: usize,
    ) -> Duration {
        let start = Instant::now();
        for _ in 0..calls {
            throttle.wait_for_token(key, limits).await.unwrap();
        }
        start.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifty_calls_at_25_per_10s() {
        let throttle = MemoryThrottle::new(Duration::from_secs(5));
        let key = ThrottleKey::new("test", "method_with_args");

        let elapsed = timed_calls(&throttle, &key, &limits(10, 25, 25), 50).await;

        assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(21), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_is_observable() {
        let throttle = MemoryThrottle::new(Duration::from_secs(5));
        let limits = limits(1, 10, 10);

        let burst_key = ThrottleKey::new("test", "burst");
        let sustained_key = ThrottleKey::new("test", "sustained");

        let burst = timed_calls(&throttle, &burst_key, &limits, 9).await;
        let sustained = timed_calls(&throttle, &sustained_key, &limits, 50).await;

        assert_eq!(burst, Duration::ZERO);
        assert!(sustained > Duration::from_secs(10), "sustained {sustained:?}");
        assert!(sustained <= Duration::from_secs(60), "sustained {sustained:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let throttle = MemoryThrottle::new(Duration::from_secs(5));
        let key = ThrottleKey::new("test", "capacity");
        let limits = limits(1, 100, 5);

        timed_calls(&throttle, &key, &limits, 4).await;
        assert_eq!(throttle.tokens(&key).await, Some(1));

        tokio::time::advance(Duration::from_secs(3600)).await;
        throttle.wait_for_token(&key, &limits).await.unwrap();

        let tokens = throttle.tokens(&key).await.unwrap();
        assert!(tokens < limits.max_tokens);
        assert_eq!(tokens, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_key_does_not_block_others() {
        let throttle = Arc::new(MemoryThrottle::new(Duration::from_secs(5)));
        let tight = limits(60, 1, 2);
        let starved = ThrottleKey::new("test", "starved");

        throttle.wait_for_token(&starved, &tight).await.unwrap();

        let waiter = {
            let throttle = throttle.clone();
            let starved = starved.clone();
            tokio::spawn(async move { throttle.wait_for_token(&starved, &tight).await })
        };
        tokio::task::yield_now().await;

        let start = Instant::now();
        throttle
            .wait_for_token(&ThrottleKey::new("test", "free"), &limits(1, 10, 10))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        let waits = waiter.await.unwrap().unwrap();
        assert!(waits > 0);
    }
}
