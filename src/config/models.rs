use crate::humanize::HumanDuration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Options applied to every crawl, lowest precedence
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub crawlers: HashMap<String, CrawlerConfig>,
}

/// Poller and worker pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_workers_num")]
    pub workers_num: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: HumanDuration,
    /// Pause between dequeue attempts when the queue is empty
    #[serde(default = "default_idle_sleep")]
    pub idle_sleep: HumanDuration,
    /// Address for the `/health` and `/stats` endpoints, disabled when unset
    pub status_addr: Option<SocketAddr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers_num: default_workers_num(),
            poll_interval: default_poll_interval(),
            idle_sleep: default_idle_sleep(),
            status_addr: None,
        }
    }
}

fn default_workers_num() -> usize {
    4
}

fn default_poll_interval() -> HumanDuration {
    HumanDuration::from_secs(10)
}

fn default_idle_sleep() -> HumanDuration {
    HumanDuration::from_secs(1)
}

/// On-disk locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_path: default_queue_path(),
            ledger_path: default_ledger_path(),
        }
    }
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queue")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/ledger")
}

/// Outbound HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: HumanDuration,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            retry: RetrySettings::default(),
        }
    }
}

fn default_connect_timeout() -> HumanDuration {
    HumanDuration::from_secs(10)
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(60)
}

fn default_user_agent() -> String {
    format!("crawlbox/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub delay: HumanDuration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay: default_retry_delay(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> HumanDuration {
    HumanDuration::from_secs(1)
}

/// Token bucket backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleBackendKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub backend: ThrottleBackendKind,
    /// Also read from `CRAWLBOX_REDIS_URL`
    pub redis_url: Option<String>,
    /// Fixed pause while a bucket is empty
    #[serde(default = "default_throttle_backoff")]
    pub backoff: HumanDuration,
    /// Limits for operations without a crawler-specific entry
    #[serde(default)]
    pub default: ThrottleLimits,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            backend: ThrottleBackendKind::default(),
            redis_url: None,
            backoff: default_throttle_backoff(),
            default: ThrottleLimits::default(),
        }
    }
}

fn default_throttle_backoff() -> HumanDuration {
    HumanDuration::from_secs(5)
}

/// Bucket shape: `rate` tokens are replenished every `window`, up to `max_tokens`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ThrottleLimits {
    #[serde(default = "default_window")]
    pub window: HumanDuration,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            window: default_window(),
            rate: default_rate(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_window() -> HumanDuration {
    HumanDuration::from_secs(1)
}

fn default_rate() -> u32 {
    10
}

fn default_max_tokens() -> u32 {
    10
}

/// Proxy selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyImplementation {
    #[default]
    None,
    Ranked,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub implementation: ProxyImplementation,
    /// Country allow-list (two-letter tags); empty means every country
    #[serde(default)]
    pub only_proxies_from: Vec<String>,
    /// Fixed candidate list used when no provider is configured
    #[serde(default)]
    pub addresses: Vec<String>,
    pub provider: Option<ProviderSettings>,
    #[serde(default)]
    pub checker: CheckerSettings,
}

/// Authenticated proxy list endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderSettings {
    #[serde(default = "default_ip_echo_url")]
    pub ip_echo_url: String,
    pub authorize_url: String,
    pub list_url: String,
    #[serde(default = "default_provider_retry")]
    pub retry: RetrySettings,
    /// Authorization header value (loaded from environment, not from config file)
    #[serde(skip)]
    pub authorization: Option<String>,
}

fn default_ip_echo_url() -> String {
    "https://api.ipify.org".to_string()
}

fn default_provider_retry() -> RetrySettings {
    RetrySettings {
        attempts: 10,
        delay: HumanDuration::from_secs(1),
    }
}

/// Background latency ranking
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckerSettings {
    #[serde(default = "default_checker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_checker_interval")]
    pub interval: HumanDuration,
    /// Connection attempts averaged per candidate
    #[serde(default = "default_probes")]
    pub probes: u32,
    #[serde(default = "default_probe_timeout")]
    pub connect_timeout: HumanDuration,
    #[serde(default = "default_checker_concurrency")]
    pub concurrency: usize,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            enabled: default_checker_enabled(),
            interval: default_checker_interval(),
            probes: default_probes(),
            connect_timeout: default_probe_timeout(),
            concurrency: default_checker_concurrency(),
        }
    }
}

fn default_checker_enabled() -> bool {
    true
}

fn default_checker_interval() -> HumanDuration {
    HumanDuration::from_secs(300)
}

fn default_probes() -> u32 {
    5
}

fn default_probe_timeout() -> HumanDuration {
    HumanDuration::from_secs(3)
}

fn default_checker_concurrency() -> usize {
    8
}

/// Per-crawler-kind settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CrawlerConfig {
    /// Default crawl options for this kind
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Limits keyed by operation name
    #[serde(default)]
    pub throttle: HashMap<String, ThrottleLimits>,
}
