//! Token-bucket rate limiting for outbound crawler operations
//!
//! A [`Throttle`] is bound to a [`ThrottleKey`] (crawler + operation + optional
//! sub-key) and a bucket shape. Buckets live in a [`ThrottleBackend`]: either
//! in this process ([`MemoryThrottle`]) or in redis ([`DistributedThrottle`]) when
//! workers are spread over several machines. Call sites are identical for both.
//!
//! ```rust,ignore
//! let throttle = ctx.throttle("company_detail").for_sub_key(&company_id);
//! let page = throttle.run(|| http.fetch(&url)).await??;
//! ```

pub mod distributed;
pub mod memory;

pub use distributed::DistributedThrottle;
pub use memory::MemoryThrottle;

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::{ThrottleBackendKind, ThrottleConfig, ThrottleLimits};
use crate::observability::Metrics;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Throttle backend is misconfigured: {0}")]
    Misconfigured(String),
}

pub type Result<T> = std::result::Result<T, ThrottleError>;

/// Identifies one token bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub crawler: String,
    pub operation: String,
    pub sub_key: Option<String>,
}

impl ThrottleKey {
    pub fn new(crawler: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            crawler: crawler.into(),
            operation: operation.into(),
            sub_key: None,
        }
    }

    pub fn with_sub_key(mut self, sub_key: impl Into<String>) -> Self {
        self.sub_key = Some(sub_key.into());
        self
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_key {
            Some(sub_key) => write!(f, "{}_{}_{}", self.crawler, self.operation, sub_key),
            None => write!(f, "{}_{}", self.crawler, self.operation),
        }
    }
}

#[async_trait]
pub trait ThrottleBackend: Send + Sync {
    /// Block until the bucket for `key` grants a token
    ///
    /// Returns how many times the caller had to back off. Never gives up: if the
    /// bucket is never refilled the call waits forever.
    async fn wait_for_token(&self, key: &ThrottleKey, limits: &ThrottleLimits) -> Result<u32>;
}

/// Build the backend selected in configuration
pub fn build_backend(config: &ThrottleConfig) -> Result<Arc<dyn ThrottleBackend>> {
    let backoff = config.backoff.as_duration();
    match config.backend {
        ThrottleBackendKind::Memory => Ok(Arc::new(MemoryThrottle::new(backoff))),
        ThrottleBackendKind::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                ThrottleError::Misconfigured("redis backend without redis_url".to_string())
            })?;
            Ok(Arc::new(DistributedThrottle::open(url, backoff)?))
        }
    }
}

/// Rate limiter bound to one bucket
#[derive(Clone)]
pub struct Throttle {
    backend: Arc<dyn ThrottleBackend>,
    key: ThrottleKey,
    limits: ThrottleLimits,
    metrics: Arc<Metrics>,
}

impl Throttle {
    pub fn new(
        backend: Arc<dyn ThrottleBackend>,
        key: ThrottleKey,
        limits: ThrottleLimits,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            key,
            limits,
            metrics,
        }
    }

    /// Same limits, separate bucket for a sub-resource (one company, one host)
    pub fn for_sub_key(&self, sub_key: impl Into<String>) -> Self {
        Self {
            key: self.key.clone().with_sub_key(sub_key),
            ..self.clone()
        }
    }

    pub fn key(&self) -> &ThrottleKey {
        &self.key
    }

    /// Wait for a token
    pub async fn wait(&self) -> Result<()> {
        let waits = self.backend.wait_for_token(&self.key, &self.limits).await?;
        if waits > 0 {
            debug!(key = %self.key, waits, "Throttled");
            self.metrics.throttled();
        }
        Ok(())
    }

    /// Wait for a token, then run `operation`
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.wait().await?;
        Ok(operation().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::HumanDuration;
    use std::time::Duration;

    #[test]
    fn test_key_format() {
        let key = ThrottleKey::new("companies", "detail");
        assert_eq!(key.to_string(), "companies_detail");
        assert_eq!(key.with_sub_key("42").to_string(), "companies_detail_42");
    }

    #[test]
    fn test_build_backend_requires_redis_url() {
        let config = ThrottleConfig {
            backend: ThrottleBackendKind::Redis,
            ..Default::default()
        };
        assert!(matches!(
            build_backend(&config),
            Err(ThrottleError::Misconfigured(_))
        ));
        assert!(build_backend(&ThrottleConfig::default()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_passes_output_through() {
        let throttle = Throttle::new(
            Arc::new(MemoryThrottle::new(Duration::from_secs(5))),
            ThrottleKey::new("companies", "list"),
            ThrottleLimits {
                window: HumanDuration::from_secs(1),
                rate: 10,
                max_tokens: 10,
            },
            Arc::new(Metrics::new()),
        );

        let value = throttle.run(|| async { 21 * 2 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_keys_have_independent_buckets() {
        let metrics = Arc::new(Metrics::new());
        let throttle = Throttle::new(
            Arc::new(MemoryThrottle::new(Duration::from_secs(5))),
            ThrottleKey::new("companies", "detail"),
            ThrottleLimits {
                window: HumanDuration::from_secs(60),
                rate: 1,
                max_tokens: 3,
            },
            metrics.clone(),
        );
        let first = throttle.for_sub_key("first");
        let second = throttle.for_sub_key("second");

        first.wait().await.unwrap();
        first.wait().await.unwrap();

        let start = tokio::time::Instant::now();
        second.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(metrics.snapshot().throttle_waits, 0);
    }
}
