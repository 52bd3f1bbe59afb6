use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "CRAWLBOX_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/crawlbox.toml";
const ENV_PREFIX: &str = "CRAWLBOX";
const ENV_SEPARATOR: &str = "__";

const PROXY_AUTHORIZATION_VAR: &str = "CRAWLBOX_PROXY_AUTHORIZATION";
const REDIS_URL_VAR: &str = "CRAWLBOX_REDIS_URL";

/// Pick the file from `CRAWLBOX_CONFIG` after reading `.env`, then layer the environment on top
pub fn load() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    load_from_sources(config_path)
}

pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!(path = %config_path.display(), "Reading configuration file");
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            path = %config_path.display(),
            "No configuration file, running on defaults and environment"
        );
    }

    // CRAWLBOX__ENGINE__WORKERS_NUM -> engine.workers_num
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let mut config: Config = builder.build()?.try_deserialize()?;
    load_secrets(&mut config);
    Ok(config)
}

fn load_secrets(config: &mut Config) {
    if let Some(provider) = config.proxy.provider.as_mut() {
        if let Ok(authorization) = env::var(PROXY_AUTHORIZATION_VAR) {
            provider.authorization = Some(authorization);
        }
    }

    if let Ok(url) = env::var(REDIS_URL_VAR) {
        config.throttle.redis_url = Some(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyImplementation, ThrottleBackendKind};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.engine.workers_num, 4);
        assert_eq!(config.engine.idle_sleep.as_duration(), Duration::from_secs(1));
        assert_eq!(config.throttle.backend, ThrottleBackendKind::Memory);
        assert_eq!(config.proxy.implementation, ProxyImplementation::None);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[engine]
workers_num = 10
poll_interval = "30s"

[storage]
queue_path = "/var/lib/crawlbox/queue"

[throttle.default]
window = "10s"
rate = 25
max_tokens = 25
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.engine.workers_num, 10);
        assert_eq!(config.engine.poll_interval.as_duration(), Duration::from_secs(30));
        assert_eq!(
            config.storage.queue_path,
            PathBuf::from("/var/lib/crawlbox/queue")
        );
        assert_eq!(config.throttle.default.rate, 25);
    }

    #[test]
    fn test_crawler_sections() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[defaults]
workers_num = 10
local_dir = "/tmp/crawls"

[crawlers.companies.options]
country = "br"
pages = 3

[crawlers.companies.throttle.list]
window = "1m"
rate = 60
max_tokens = 30
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.defaults["local_dir"], "/tmp/crawls");

        let companies = &config.crawlers["companies"];
        assert_eq!(companies.options["country"], "br");
        assert_eq!(companies.options["pages"], 3);
        assert_eq!(
            companies.throttle["list"].window.as_duration(),
            Duration::from_secs(60)
        );
    }
}
