//! Background latency ranking of proxy candidates

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{ProxyRecord, RankedProxyPool};
use crate::config::CheckerSettings;

#[async_trait]
pub trait Prober: Send + Sync {
    /// Round-trip time of one connection attempt, `None` if it failed
    async fn probe(&self, address: &str) -> Option<Duration>;
}

/// Measures the time to open a TCP connection to the proxy
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: &str) -> Option<Duration> {
        let host = address.rsplit('@').next().unwrap_or(address);
        let start = Instant::now();

        match tokio::time::timeout(self.timeout, TcpStream::connect(host)).await {
            Ok(Ok(_)) => Some(start.elapsed()),
            Ok(Err(e)) => {
                debug!(address = host, error = %e, "Probe failed");
                None
            }
            Err(_) => {
                debug!(address = host, "Probe timed out");
                None
            }
        }
    }
}

pub struct QualityChecker {
    pool: Arc<RankedProxyPool>,
    prober: Arc<dyn Prober>,
    probes: u32,
    concurrency: usize,
    interval: Duration,
}

impl QualityChecker {
    pub fn new(
        pool: Arc<RankedProxyPool>,
        prober: Arc<dyn Prober>,
        settings: &CheckerSettings,
    ) -> Self {
        Self {
            pool,
            prober,
            probes: settings.probes.max(1),
            concurrency: settings.concurrency.max(1),
            interval: settings.interval.as_duration(),
        }
    }

    /// Mean latency in milliseconds over all probes; one failed probe discards the candidate
    pub async fn measure(&self, address: &str) -> Option<f64> {
        let mut total = Duration::ZERO;
        for _ in 0..self.probes {
            total += self.prober.probe(address).await?;
        }
        Some(total.as_secs_f64() * 1000.0 / f64::from(self.probes))
    }

    /// Probe every candidate and publish the reachable ones, fastest first
    pub async fn check_once(&self) -> usize {
        let candidates = self.pool.get_available_proxies().await;
        let total = candidates.len();

        let mut ranked: Vec<ProxyRecord> = stream::iter(candidates)
            .map(|record| async move {
                let latency = self.measure(&record.address).await?;
                Some(ProxyRecord {
                    latency_ms: Some(latency),
                    ..record
                })
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|record| async move { record })
            .collect()
            .await;

        ranked.sort_by(|a, b| {
            let a = a.latency_ms.unwrap_or(f64::MAX);
            let b = b.latency_ms.unwrap_or(f64::MAX);
            a.total_cmp(&b)
        });

        let reachable = ranked.len();
        self.pool.set_to_use_proxies(ranked).await;
        info!(total, reachable, "Proxy quality check finished");
        reachable
    }

    /// Re-rank on every interval until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.changed() => {
                    info!("Proxy quality checker stopping");
                    break;
                }
            }
        }
    }
}
