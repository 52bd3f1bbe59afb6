use rand::Rng;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use super::provider::ProxyProvider;
use super::{ProxyError, ProxyRecord};

const MIN_ACTIVE: usize = 6;

/// Size of the active prefix for `total` ranked candidates
pub fn active_size(total: usize) -> usize {
    total.div_ceil(2).max(MIN_ACTIVE).min(total)
}

/// Candidate cache plus the ranked list selection draws from
///
/// Until the quality checker publishes a ranking, the active list is the
/// provider's order. Selection only ever looks at the first
/// [`active_size`] entries.
pub struct RankedProxyPool {
    provider: Arc<dyn ProxyProvider>,
    available: OnceCell<Vec<ProxyRecord>>,
    active: RwLock<Vec<ProxyRecord>>,
}

impl RankedProxyPool {
    pub fn new(provider: Arc<dyn ProxyProvider>) -> Self {
        Self {
            provider,
            available: OnceCell::new(),
            active: RwLock::new(Vec::new()),
        }
    }

    /// Load candidates once; failures are not cached so the next call tries again
    pub async fn get_available_proxies(&self) -> Vec<ProxyRecord> {
        let loaded = self
            .available
            .get_or_try_init(|| async {
                let candidates = self.provider.list_candidates().await?;
                if candidates.is_empty() {
                    return Err(ProxyError::NoCandidates);
                }

                info!(candidates = candidates.len(), "Proxy candidates loaded");
                *self.active.write().await = candidates.clone();
                Ok::<_, ProxyError>(candidates)
            })
            .await;

        match loaded {
            Ok(candidates) => candidates.clone(),
            Err(e) => {
                warn!(error = %e, "Proxy candidates unavailable");
                Vec::new()
            }
        }
    }

    pub async fn get_proxy_address(&self) -> Option<ProxyRecord> {
        if self.available.get().is_none() {
            self.get_available_proxies().await;
        }

        let active = self.active.read().await;
        let size = active_size(active.len());
        if size == 0 {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..size);
        active.get(index).cloned()
    }

    /// Replace the ranked list in one step
    pub async fn set_to_use_proxies(&self, ranked: Vec<ProxyRecord>) {
        let size = active_size(ranked.len());
        *self.active.write().await = ranked;
        info!(active = size, "Active proxy pool replaced");
    }

    pub async fn active(&self) -> Vec<ProxyRecord> {
        let active = self.active.read().await;
        active[..active_size(active.len())].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::provider::StaticProxyProvider;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("us{i}.example.net:3128")).collect()
    }

    fn pool_of(n: usize) -> RankedProxyPool {
        RankedProxyPool::new(Arc::new(StaticProxyProvider::new(addresses(n), Vec::new())))
    }

    #[test]
    fn test_active_size() {
        assert_eq!(active_size(0), 0);
        assert_eq!(active_size(4), 4);
        assert_eq!(active_size(6), 6);
        assert_eq!(active_size(11), 6);
        assert_eq!(active_size(13), 7);
        assert_eq!(active_size(20), 10);
    }

    #[tokio::test]
    async fn test_selection_covers_active_prefix_only() {
        let pool = pool_of(20);
        pool.get_available_proxies().await;

        let active: HashSet<String> = pool
            .active()
            .await
            .into_iter()
            .map(|record| record.address)
            .collect();
        assert_eq!(active.len(), 10);

        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let record = pool.get_proxy_address().await.unwrap();
            assert!(active.contains(&record.address), "{} is inactive", record.address);
            seen.insert(record.address);
        }
        assert!(seen.len() > active.len() / 2);
    }

    #[tokio::test]
    async fn test_swap_changes_selection() {
        let pool = pool_of(8);
        pool.get_available_proxies().await;

        pool.set_to_use_proxies(vec![ProxyRecord::from_address("de1:3128")])
            .await;
        for _ in 0..20 {
            assert_eq!(pool.get_proxy_address().await.unwrap().address, "de1:3128");
        }

        pool.set_to_use_proxies(Vec::new()).await;
        assert!(pool.get_proxy_address().await.is_none());
    }

    struct FlakyProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProxyProvider for FlakyProvider {
        async fn list_candidates(&self) -> crate::proxy::Result<Vec<ProxyRecord>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ProxyError::Unauthorized("not yet".to_string()));
            }
            Ok(vec![ProxyRecord::from_address("fr1:3128")])
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
        });
        let pool = RankedProxyPool::new(provider.clone());

        assert!(pool.get_available_proxies().await.is_empty());
        assert!(pool.get_proxy_address().await.is_some());
        assert_eq!(pool.get_available_proxies().await.len(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
