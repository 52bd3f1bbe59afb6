//! Settings for every crawlbox component
//!
//! Values are resolved in three layers, later ones winning: the defaults baked
//! into the config structs, the TOML file, then `CRAWLBOX__*` environment
//! variables. The result is validated before anything is opened.
//!
//! ```no_run
//! use crawlbox::config::Config;
//!
//! let config = Config::load().expect("invalid configuration");
//! println!("{} workers polling every {}", config.engine.workers_num, config.engine.poll_interval);
//! ```
//!
//! Nested keys are addressed with a double underscore, e.g.
//! `CRAWLBOX__ENGINE__WORKERS_NUM=16` or `CRAWLBOX__THROTTLE__BACKEND=redis`.
//! The file is `config/crawlbox.toml` unless `CRAWLBOX_CONFIG` points elsewhere.
//!
//! Secrets only come from the environment: `CRAWLBOX_PROXY_AUTHORIZATION`
//! and `CRAWLBOX_REDIS_URL`.

mod models;
mod sources;
mod validation;

pub use crate::humanize::HumanDuration;
pub use models::{
    CheckerSettings, Config, CrawlerConfig, EngineConfig, HttpSettings, ProviderSettings,
    ProxyConfig, ProxyImplementation, RetrySettings, StorageConfig, ThrottleBackendKind,
    ThrottleConfig, ThrottleLimits,
};
pub use validation::ValidationError;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Resolve defaults, the TOML file named by `CRAWLBOX_CONFIG` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Like [`Config::load`] with an explicit file (`--config`)
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Default options configured for a crawler kind (empty when unknown)
    pub fn crawler_options(&self, kind: &str) -> Map<String, Value> {
        self.crawlers
            .get(kind)
            .map(|c| c.options.clone())
            .unwrap_or_default()
    }

    /// Bucket shape for `operation` of `crawler`, falling back to `[throttle.default]`
    pub fn throttle_limits(&self, crawler: &str, operation: &str) -> ThrottleLimits {
        self.crawlers
            .get(crawler)
            .and_then(|c| c.throttle.get(operation))
            .copied()
            .unwrap_or(self.throttle.default)
    }
}
