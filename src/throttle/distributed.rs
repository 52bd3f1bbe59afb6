use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Result, ThrottleBackend, ThrottleKey};
use crate::config::ThrottleLimits;

const NAMESPACE: &str = "crawlbox:throttle";

// KEYS[1] bucket, ARGV: now_us, window_us, limit, member
const SLIDING_WINDOW: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
if redis.call('ZCARD', KEYS[1]) < limit then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
    redis.call('PEXPIRE', KEYS[1], math.ceil(window / 1000))
    return 1
end
return 0
"#;

/// Rate limiter shared by every worker that talks to the same redis
///
/// Each bucket is a sorted set of grant timestamps; a token is granted while
/// fewer than `rate` grants fall inside the trailing window. The check and the
/// grant run as one script, so concurrent workers never over-grant.
///
/// The connection is shared until a call on it fails; the next call dials again.
pub struct DistributedThrottle {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    script: Script,
    backoff: Duration,
}

impl DistributedThrottle {
    /// Parse the url; the connection itself is opened on first use
    pub fn open(url: &str, backoff: Duration) -> Result<Self> {
        let client = Client::open(url)?;
        info!(backoff = ?backoff, "Distributed throttle configured");

        Ok(Self {
            client,
            connection: Mutex::new(None),
            script: Script::new(SLIDING_WINDOW),
            backoff,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut cached = self.connection.lock().await;
        if let Some(connection) = cached.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self.client.get_multiplexed_async_connection().await?;
        debug!("Connected to redis");
        *cached = Some(connection.clone());
        Ok(connection)
    }

    async fn try_acquire(&self, bucket: &str, limits: &ThrottleLimits) -> Result<bool> {
        let mut connection = self.connection().await?;
        let now_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let window_us = limits.window.as_duration().as_micros() as u64;

        let granted: i64 = match self
            .script
            .key(bucket)
            .arg(now_us)
            .arg(window_us)
            .arg(limits.rate)
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut connection)
            .await
        {
            Ok(granted) => granted,
            Err(e) => {
                warn!(key = %bucket, error = %e, "Redis call failed, dropping connection");
                self.connection.lock().await.take();
                return Err(e.into());
            }
        };

        Ok(granted == 1)
    }
}

#[async_trait]
impl ThrottleBackend for DistributedThrottle {
    async fn wait_for_token(&self, key: &ThrottleKey, limits: &ThrottleLimits) -> Result<u32> {
        let bucket = format!("{NAMESPACE}:{key}");
        let mut waits = 0;

        while !self.try_acquire(&bucket, limits).await? {
            waits += 1;
            debug!(key = %bucket, waits, "Window full, backing off");
            tokio::time::sleep(self.backoff).await;
        }

        Ok(waits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::HumanDuration;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_open_rejects_bad_url() {
        assert!(DistributedThrottle::open("not a url", Duration::from_secs(5)).is_err());
        assert!(DistributedThrottle::open("redis://127.0.0.1:6379", Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn test_failed_call_dials_again() {
        // Accepts and hangs up immediately
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let throttle =
            DistributedThrottle::open(&format!("redis://{address}"), Duration::from_millis(10))
                .unwrap();
        let limits = ThrottleLimits::default();

        for _ in 0..2 {
            let result = tokio::time::timeout(
                Duration::from_secs(5),
                throttle.try_acquire("crawlbox:throttle:test", &limits),
            )
            .await
            .expect("redis call hung");
            assert!(result.is_err());
            assert!(throttle.connection.lock().await.is_none());
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[ignore = "needs a redis server in CRAWLBOX_TEST_REDIS_URL"]
    async fn test_window_limits_grants() {
        let url = std::env::var("CRAWLBOX_TEST_REDIS_URL").unwrap();
        let throttle = DistributedThrottle::open(&url, Duration::from_millis(100)).unwrap();
        let key = ThrottleKey::new("test", Uuid::new_v4().to_string());
        let limits = ThrottleLimits {
            window: HumanDuration::from_secs(1),
            rate: 3,
            max_tokens: 3,
        };

        for _ in 0..3 {
            assert_eq!(throttle.wait_for_token(&key, &limits).await.unwrap(), 0);
        }
        assert!(throttle.wait_for_token(&key, &limits).await.unwrap() > 0);
    }
}
