//! Egress proxy selection
//!
//! [`ProxyManager`] is picked from configuration: `none` always connects directly,
//! `ranked` draws from a [`RankedProxyPool`] whose active prefix is maintained by a
//! background [`QualityChecker`].

pub mod checker;
pub mod pool;
pub mod provider;

pub use checker::{Prober, QualityChecker, TcpProber};
pub use pool::{RankedProxyPool, active_size};
pub use provider::{HttpProxyProvider, ProxyProvider, StaticProxyProvider};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ProxyConfig, ProxyImplementation};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider refused authorization: {0}")]
    Unauthorized(String),

    #[error("Provider returned no candidates")]
    NoCandidates,

    #[error("Ranked proxies need a provider or a static address list")]
    NoSource,
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// One candidate proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    /// `host:port`, optionally prefixed with `user:pass@`
    pub address: String,
    pub country: Option<String>,
    /// Mean connect latency; `None` until measured
    pub latency_ms: Option<f64>,
}

impl ProxyRecord {
    /// Addresses carry their country in the first two characters, except the
    /// provider's untagged `open*` entries
    pub fn from_address(address: impl Into<String>) -> Self {
        let address = address.into();
        let country = if address.starts_with("open") {
            None
        } else {
            address.get(..2).map(str::to_lowercase)
        };

        Self {
            address,
            country,
            latency_ms: None,
        }
    }

    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.address)
    }
}

/// Selection strategy shared by every worker
#[derive(Clone)]
pub enum ProxyManager {
    NoProxy,
    Ranked(Arc<RankedProxyPool>),
}

impl ProxyManager {
    pub fn from_config(config: &ProxyConfig, client: reqwest::Client) -> Result<Self> {
        match config.implementation {
            ProxyImplementation::None => Ok(Self::NoProxy),
            ProxyImplementation::Ranked => {
                let provider: Arc<dyn ProxyProvider> = match &config.provider {
                    Some(settings) => Arc::new(HttpProxyProvider::new(
                        client,
                        settings.clone(),
                        config.only_proxies_from.clone(),
                    )),
                    None if !config.addresses.is_empty() => Arc::new(StaticProxyProvider::new(
                        config.addresses.clone(),
                        config.only_proxies_from.clone(),
                    )),
                    None => return Err(ProxyError::NoSource),
                };
                Ok(Self::Ranked(Arc::new(RankedProxyPool::new(provider))))
            }
        }
    }

    /// Every known candidate; empty when proxies are disabled or the provider failed
    pub async fn get_available_proxies(&self) -> Vec<ProxyRecord> {
        match self {
            Self::NoProxy => Vec::new(),
            Self::Ranked(pool) => pool.get_available_proxies().await,
        }
    }

    /// A random member of the active pool, `None` means connect directly
    pub async fn get_proxy_address(&self) -> Option<ProxyRecord> {
        match self {
            Self::NoProxy => None,
            Self::Ranked(pool) => pool.get_proxy_address().await,
        }
    }

    pub async fn set_to_use_proxies(&self, ranked: Vec<ProxyRecord>) {
        if let Self::Ranked(pool) = self {
            pool.set_to_use_proxies(ranked).await;
        }
    }

    pub fn pool(&self) -> Option<&Arc<RankedProxyPool>> {
        match self {
            Self::NoProxy => None,
            Self::Ranked(pool) => Some(pool),
        }
    }
}
