//! Proxy-aware HTTP client with bounded retries

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, Proxy, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::retry::{RetryPolicy, retry_outcome};
use crate::config::HttpSettings;
use crate::observability::Metrics;
use crate::proxy::{ProxyManager, ProxyRecord};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid proxy {address}: {source}")]
    InvalidProxy {
        address: String,
        #[source]
        source: reqwest::Error,
    },
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// A downloaded response body
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub status: u16,
    pub body: Bytes,
    /// Proxy address the page came through, `None` for a direct connection
    pub proxy: Option<String>,
}

impl Page {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn is_retryable(outcome: &std::result::Result<Response, reqwest::Error>) -> bool {
    match outcome {
        Ok(response) => response.status().as_u16() >= 400,
        Err(_) => true,
    }
}

/// GET `url`, retrying transport errors and responses with status >= 400
///
/// Once attempts run out the last response is returned even if it is an error
/// status; the caller decides what a 404 means.
pub async fn fetch_tenaciously<P>(
    client: &Client,
    url: &str,
    policy: &RetryPolicy,
    should_retry: P,
) -> std::result::Result<Response, reqwest::Error>
where
    P: FnMut(&std::result::Result<Response, reqwest::Error>) -> bool,
{
    retry_outcome(policy, || client.get(url).send(), is_retryable, should_retry).await
}

/// A response body written to disk by [`HttpClient::fetch_file`]
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub url: String,
    pub status: u16,
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub proxy: Option<String>,
}

/// Outbound client used by crawlers
///
/// Every attempt draws a proxy from the [`ProxyManager`], so a retry after a
/// dead proxy goes out through another one. When none is available the request
/// goes out directly and the fallback is counted.
pub struct HttpClient {
    direct: Client,
    settings: HttpSettings,
    proxies: ProxyManager,
    metrics: Arc<Metrics>,
    policy: RetryPolicy,
    proxied: Mutex<HashMap<String, Client>>,
}

impl HttpClient {
    pub fn new(
        settings: &HttpSettings,
        proxies: ProxyManager,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let direct = Self::builder(settings).build()?;

        Ok(Self {
            direct,
            settings: settings.clone(),
            proxies,
            metrics,
            policy: RetryPolicy::from(&settings.retry),
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn builder(settings: &HttpSettings) -> ClientBuilder {
        Client::builder()
            .connect_timeout(settings.connect_timeout.as_duration())
            .timeout(settings.request_timeout.as_duration())
            .user_agent(&settings.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
    }

    /// Client without any proxy
    pub fn direct(&self) -> &Client {
        &self.direct
    }

    pub fn proxies(&self) -> &ProxyManager {
        &self.proxies
    }

    async fn client_for(&self, record: &ProxyRecord) -> Result<Client> {
        let mut proxied = self.proxied.lock().await;
        if let Some(client) = proxied.get(&record.address) {
            return Ok(client.clone());
        }

        let invalid = |source| FetchError::InvalidProxy {
            address: record.address.clone(),
            source,
        };
        let proxy = Proxy::all(record.proxy_url()).map_err(invalid)?;
        let client = Self::builder(&self.settings)
            .proxy(proxy)
            .build()
            .map_err(invalid)?;

        proxied.insert(record.address.clone(), client.clone());
        Ok(client)
    }

    async fn pick_client(&self) -> Result<(Client, Option<String>)> {
        match self.proxies.get_proxy_address().await {
            Some(record) => Ok((self.client_for(&record).await?, Some(record.address))),
            None => {
                if self.proxies.pool().is_some() {
                    warn!("No proxy available, falling back to direct connection");
                    self.metrics.proxy_fallback();
                }
                Ok((self.direct.clone(), None))
            }
        }
    }

    /// Send the request built by `build` until it succeeds or the policy is spent
    ///
    /// Transport errors, unusable proxies and statuses >= 400 are retried, each
    /// attempt through a freshly picked proxy. Error statuses left after the last
    /// attempt surface as [`FetchError::Status`].
    async fn send<B>(&self, url: &str, build: B) -> Result<(Response, Option<String>)>
    where
        B: Fn(&Client) -> RequestBuilder + Sync,
    {
        let build = &build;
        let (response, proxy) = retry_outcome(
            &self.policy,
            move || async move {
                let (client, proxy) = self.pick_client().await?;
                debug!(url, proxy = ?proxy, "Sending request");
                match build(&client).send().await {
                    Ok(response) => Ok::<_, FetchError>((response, proxy)),
                    Err(e) => {
                        warn!(url, proxy = ?proxy, error = %e, "Request failed");
                        Err(FetchError::from(e))
                    }
                }
            },
            |outcome| match outcome {
                Ok((response, _)) => response.status().as_u16() >= 400,
                Err(FetchError::Request(_) | FetchError::InvalidProxy { .. }) => true,
                Err(_) => false,
            },
            |_| true,
        )
        .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok((response, proxy))
    }

    async fn into_page(url: &str, response: Response, proxy: Option<String>) -> Result<Page> {
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        debug!(url, status, size = body.len(), "Download completed");

        Ok(Page {
            url: url.to_string(),
            status,
            body,
            proxy,
        })
    }

    /// Download `url` through a proxy; error statuses surface as [`FetchError::Status`]
    pub async fn get(&self, url: &str) -> Result<Page> {
        let (response, proxy) = self.send(url, |client| client.get(url)).await?;
        Self::into_page(url, response, proxy).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.get(url).await?.json()
    }

    /// POST `body` as JSON
    pub async fn post_json<T>(&self, url: &str, body: &T) -> Result<Page>
    where
        T: Serialize + Sync + ?Sized,
    {
        let (response, proxy) = self
            .send(url, |client| client.post(url).json(body))
            .await?;
        Self::into_page(url, response, proxy).await
    }

    /// POST `form` url-encoded
    pub async fn post_form<T>(&self, url: &str, form: &T) -> Result<Page>
    where
        T: Serialize + Sync + ?Sized,
    {
        let (response, proxy) = self
            .send(url, |client| client.post(url).form(form))
            .await?;
        Self::into_page(url, response, proxy).await
    }

    pub async fn delete_json(&self, url: &str) -> Result<Page> {
        let (response, proxy) = self
            .send(url, |client| {
                client
                    .delete(url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(ACCEPT, "application/json")
            })
            .await?;
        Self::into_page(url, response, proxy).await
    }

    /// Stream `url` into `dir`
    ///
    /// The file name comes from `Content-Disposition` when the server sends one,
    /// otherwise from the last path segment of the final URL.
    pub async fn fetch_file(&self, url: &str, dir: &Path) -> Result<DownloadedFile> {
        let (mut response, proxy) = self.send(url, |client| client.get(url)).await?;
        let status = response.status().as_u16();
        let filename = file_name(&response);

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&filename);
        let mut file = tokio::fs::File::create(&path).await?;

        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;

        info!(url, path = %path.display(), size, "File downloaded");
        Ok(DownloadedFile {
            url: url.to_string(),
            status,
            path,
            filename,
            size,
            proxy,
        })
    }
}

fn attachment_name(response: &Response) -> Option<String> {
    let header = response.headers().get(CONTENT_DISPOSITION)?.to_str().ok()?;
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
}

/// Base name of the attachment or URL path; `download` when neither has one
fn file_name(response: &Response) -> String {
    let candidate = attachment_name(response).or_else(|| {
        response
            .url()
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string)
    });

    candidate
        .as_deref()
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
        .to_string()
}
