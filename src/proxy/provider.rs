//! Proxy candidate sources

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::{debug, info};

use super::{ProxyError, ProxyRecord, Result};
use crate::config::ProviderSettings;
use crate::net::retry::{RetryPolicy, retry};

const ALREADY_AUTHORIZED: &str = "already authorized";

#[async_trait]
pub trait ProxyProvider: Send + Sync {
    async fn list_candidates(&self) -> Result<Vec<ProxyRecord>>;
}

fn allowed(record: &ProxyRecord, only_from: &[String]) -> bool {
    if only_from.is_empty() {
        return true;
    }
    record
        .country
        .as_deref()
        .is_some_and(|country| only_from.iter().any(|c| c.eq_ignore_ascii_case(country)))
}

fn filter_candidates(addresses: Vec<String>, only_from: &[String]) -> Vec<ProxyRecord> {
    addresses
        .into_iter()
        .map(ProxyRecord::from_address)
        .filter(|record| allowed(record, only_from))
        .collect()
}

/// Fixed list from configuration
pub struct StaticProxyProvider {
    addresses: Vec<String>,
    only_from: Vec<String>,
}

impl StaticProxyProvider {
    pub fn new(addresses: Vec<String>, only_from: Vec<String>) -> Self {
        Self {
            addresses,
            only_from,
        }
    }
}

#[async_trait]
impl ProxyProvider for StaticProxyProvider {
    async fn list_candidates(&self) -> Result<Vec<ProxyRecord>> {
        Ok(filter_candidates(self.addresses.clone(), &self.only_from))
    }
}

#[derive(Debug, Deserialize)]
struct ProxyList {
    proxies: Vec<String>,
}

/// Provider behind an egress-IP allow list
///
/// The handshake discovers this machine's public address, registers it with
/// the provider, then downloads the list. Every step is retried.
pub struct HttpProxyProvider {
    client: Client,
    settings: ProviderSettings,
    only_from: Vec<String>,
    policy: RetryPolicy,
}

impl HttpProxyProvider {
    pub fn new(client: Client, settings: ProviderSettings, only_from: Vec<String>) -> Self {
        let policy = RetryPolicy::from(&settings.retry);
        Self {
            client,
            settings,
            only_from,
            policy,
        }
    }

    async fn egress_ip(&self) -> Result<String> {
        let url = self.settings.ip_echo_url.as_str();
        retry(&self.policy, || async move {
            let response = self.client.get(url).send().await?.error_for_status()?;
            Ok::<_, ProxyError>(response.text().await?.trim().to_string())
        })
        .await
    }

    async fn authorize(&self, ip: &str) -> Result<()> {
        let Some(authorization) = self.settings.authorization.as_deref() else {
            debug!("No provider authorization configured, skipping handshake");
            return Ok(());
        };
        let url = self.settings.authorize_url.as_str();

        retry(&self.policy, || async move {
            let response = self
                .client
                .post(url)
                .header(AUTHORIZATION, authorization)
                .form(&[("ip", ip)])
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;
            if status.is_success() || body.contains(ALREADY_AUTHORIZED) {
                Ok::<_, ProxyError>(())
            } else {
                Err(ProxyError::Unauthorized(format!("{status}: {}", body.trim())))
            }
        })
        .await
    }

    async fn download(&self) -> Result<Vec<String>> {
        let url = self.settings.list_url.as_str();
        retry(&self.policy, || async move {
            let response = self.client.get(url).send().await?.error_for_status()?;
            Ok::<_, ProxyError>(response.json::<ProxyList>().await?.proxies)
        })
        .await
    }
}

#[async_trait]
impl ProxyProvider for HttpProxyProvider {
    async fn list_candidates(&self) -> Result<Vec<ProxyRecord>> {
        let ip = self.egress_ip().await?;
        self.authorize(&ip).await?;
        info!(%ip, "Egress address authorized with proxy provider");

        let addresses = self.download().await?;
        let total = addresses.len();
        let candidates = filter_candidates(addresses, &self.only_from);
        debug!(total, kept = candidates.len(), "Proxy list downloaded");

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> Vec<String> {
        ["de1:3128", "us1:3128", "open1:3128", "DE2:3128"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_static_without_allow_list_keeps_all() {
        let provider = StaticProxyProvider::new(list(), Vec::new());
        assert_eq!(provider.list_candidates().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_allow_list_skips_other_and_untagged() {
        let provider = StaticProxyProvider::new(list(), vec!["de".to_string()]);
        let addresses: Vec<String> = provider
            .list_candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.address)
            .collect();

        assert_eq!(addresses, vec!["de1:3128", "DE2:3128"]);
    }

    #[test]
    fn test_proxy_list_shape() {
        let parsed: ProxyList = serde_json::from_str(r#"{"proxies": ["de1:3128"]}"#).unwrap();
        assert_eq!(parsed.proxies, vec!["de1:3128"]);
    }
}
