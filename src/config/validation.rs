use super::models::{Config, ProxyImplementation, ThrottleBackendKind, ThrottleLimits};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workers_num must be at least 1")]
    NoWorkers,

    #[error("Duration must be positive: {field}")]
    ZeroDuration { field: String },

    #[error("Throttle limits for '{scope}' are unusable: {reason}")]
    InvalidThrottleLimits { scope: String, reason: String },

    #[error("Throttle backend is redis but no redis_url is configured")]
    MissingRedisUrl,

    #[error("Ranked proxies need a provider or a static address list")]
    MissingProxySource,

    #[error("Proxy checker probes must be at least 1")]
    NoProbes,

    #[error("Retry attempts must be at least 1: {field}")]
    NoRetryAttempts { field: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_engine(config)?;
    validate_http(config)?;
    validate_throttle(config)?;
    validate_proxy(config)?;
    Ok(())
}

fn validate_engine(config: &Config) -> Result<(), ValidationError> {
    if config.engine.workers_num == 0 {
        return Err(ValidationError::NoWorkers);
    }
    if config.engine.poll_interval.is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "engine.poll_interval".to_string(),
        });
    }
    if config.engine.idle_sleep.is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "engine.idle_sleep".to_string(),
        });
    }
    Ok(())
}

fn validate_http(config: &Config) -> Result<(), ValidationError> {
    if config.http.retry.attempts == 0 {
        return Err(ValidationError::NoRetryAttempts {
            field: "http.retry.attempts".to_string(),
        });
    }
    Ok(())
}

fn validate_throttle(config: &Config) -> Result<(), ValidationError> {
    if config.throttle.backend == ThrottleBackendKind::Redis && config.throttle.redis_url.is_none()
    {
        return Err(ValidationError::MissingRedisUrl);
    }

    if config.throttle.backoff.is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "throttle.backoff".to_string(),
        });
    }

    validate_limits("default", &config.throttle.default)?;

    for (crawler, crawler_config) in &config.crawlers {
        for (operation, limits) in &crawler_config.throttle {
            validate_limits(&format!("{crawler}.{operation}"), limits)?;
        }
    }

    Ok(())
}

/// A bucket only releases tokens while more than one is left
fn validate_limits(scope: &str, limits: &ThrottleLimits) -> Result<(), ValidationError> {
    let reason = if limits.window.is_zero() {
        Some("window must be positive")
    } else if limits.rate == 0 {
        Some("rate must be positive")
    } else if limits.max_tokens < 2 {
        Some("max_tokens must be at least 2")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ValidationError::InvalidThrottleLimits {
            scope: scope.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn validate_proxy(config: &Config) -> Result<(), ValidationError> {
    if config.proxy.implementation == ProxyImplementation::None {
        return Ok(());
    }

    if config.proxy.provider.is_none() && config.proxy.addresses.is_empty() {
        return Err(ValidationError::MissingProxySource);
    }

    if let Some(provider) = &config.proxy.provider {
        if provider.retry.attempts == 0 {
            return Err(ValidationError::NoRetryAttempts {
                field: "proxy.provider.retry.attempts".to_string(),
            });
        }
    }

    let checker = &config.proxy.checker;
    if checker.enabled {
        if checker.probes == 0 {
            return Err(ValidationError::NoProbes);
        }
        if checker.interval.is_zero() {
            return Err(ValidationError::ZeroDuration {
                field: "proxy.checker.interval".to_string(),
            });
        }
    }

    Ok(())
}
