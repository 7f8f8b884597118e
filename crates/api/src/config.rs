//! API server configuration

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Per-user request budgets for the endpoints that reach the payment processor
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub sync_per_window: i64,
    pub reconcile_per_window: i64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sync_per_window: 10,
            reconcile_per_window: 5,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub redis_url: String,
    pub jwt_secret: String,
    /// Bearer credential the scheduler presents to the internal endpoints
    pub retry_drain_secret: String,
    pub retry_drain_batch: usize,
    pub cors_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Defaults for everything except the two secrets
    pub fn new(jwt_secret: impl Into<String>, retry_drain_secret: impl Into<String>) -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            jwt_secret: jwt_secret.into(),
            retry_drain_secret: retry_drain_secret.into(),
            retry_drain_batch: 25,
            cors_origins: Vec::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = required("JWT_SECRET")?;
        let retry_drain_secret = required("RETRY_DRAIN_SECRET")?;
        if retry_drain_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                key: "RETRY_DRAIN_SECRET",
                value: "must be at least 32 characters".into(),
            });
        }

        let mut config = Self::new(jwt_secret, retry_drain_secret);
        if let Ok(addr) = env::var("BIND_ADDR") {
            config.bind_address = addr;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            config.redis_url = url;
        }
        config.retry_drain_batch = parse_or("RETRY_DRAIN_BATCH", config.retry_drain_batch)?;
        config.cors_origins = env::var("CORS_ORIGINS")
            .map(|v| parse_origins(&v))
            .unwrap_or_default();

        let defaults = RateLimitConfig::default();
        config.rate_limit = RateLimitConfig {
            sync_per_window: parse_or("SYNC_RATE_LIMIT", defaults.sync_per_window)?,
            reconcile_per_window: parse_or("RECONCILE_RATE_LIMIT", defaults.reconcile_per_window)?,
            window: Duration::from_secs(parse_or("RATE_LIMIT_WINDOW_SECS", 60)?),
        };

        Ok(config)
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins_skips_blanks() {
        assert_eq!(
            parse_origins("https://app.example.com, ,http://localhost:3000,"),
            vec!["https://app.example.com", "http://localhost:3000"]
        );
    }

    #[test]
    fn test_new_uses_default_batch() {
        let config = Config::new("jwt", "drain");
        assert_eq!(config.retry_drain_batch, 25);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
    }
}
