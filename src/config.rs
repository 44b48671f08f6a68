// Application configuration loaded from environment variables

use std::{num::NonZeroU32, time::Duration};

use governor::Quota;
use tracing::warn;

use crate::auth::token::{TokenService, DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS};

const DEV_ACCESS_SECRET: &str = "dev-access-secret-do-not-use-in-production";
const DEV_REFRESH_SECRET: &str = "dev-refresh-secret-do-not-use-in-production";

/// Upper bound for every duration setting: ten years
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Configuration loading failures
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set in production")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Insecure(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub production: bool,
    pub host: String,
    pub port: u16,
    /// Postgres connection string; `None` runs on in-memory stores
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub refresh_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    /// Tokens added to each client's bucket per second
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: u32,
    pub rate_limit_max_clients: usize,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub sweep_interval: Duration,
    pub store_timeout: Duration,
    pub request_timeout: Duration,
}

impl Config {
    /// Load from the process environment (after `.env`, if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let production = get("APP_ENV")
            .map(|env| env.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let database_url = get("DATABASE_URL");
        if production && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let jwt_secret = secret(get("JWT_SECRET"), "JWT_SECRET", DEV_ACCESS_SECRET, production)?;
        let refresh_secret = secret(
            get("REFRESH_SECRET"),
            "REFRESH_SECRET",
            DEV_REFRESH_SECRET,
            production,
        )?;
        if production && jwt_secret == refresh_secret {
            return Err(ConfigError::Insecure(
                "JWT_SECRET and REFRESH_SECRET must differ",
            ));
        }

        let rate_limit_per_second: f64 =
            parse(get("RATE_LIMIT_PER_SECOND"), "RATE_LIMIT_PER_SECOND", 1.0 / 60.0)?;
        if !(rate_limit_per_second.is_finite() && rate_limit_per_second > 0.0) {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_PER_SECOND",
                value: rate_limit_per_second.to_string(),
            });
        }

        let config = Self {
            production,
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(get("PORT"), "PORT", 8080)?,
            database_url,
            jwt_secret,
            refresh_secret,
            access_token_ttl: seconds(
                get("ACCESS_TOKEN_TTL_SECS"),
                "ACCESS_TOKEN_TTL_SECS",
                DEFAULT_ACCESS_TTL_SECS as u64,
            )?,
            refresh_token_ttl: seconds(
                get("REFRESH_TOKEN_TTL_SECS"),
                "REFRESH_TOKEN_TTL_SECS",
                DEFAULT_REFRESH_TTL_SECS as u64,
            )?,
            rate_limit_per_second,
            rate_limit_burst: positive(get("RATE_LIMIT_BURST"), "RATE_LIMIT_BURST", 60)?,
            rate_limit_max_clients: positive(
                get("RATE_LIMIT_MAX_CLIENTS"),
                "RATE_LIMIT_MAX_CLIENTS",
                10_000,
            )?,
            cache_ttl: seconds(get("CACHE_TTL_SECS"), "CACHE_TTL_SECS", 300)?,
            cache_max_entries: positive(get("CACHE_MAX_ENTRIES"), "CACHE_MAX_ENTRIES", 1_000)?,
            sweep_interval: seconds(get("SWEEP_INTERVAL_SECS"), "SWEEP_INTERVAL_SECS", 60)?,
            store_timeout: seconds(get("STORE_TIMEOUT_SECS"), "STORE_TIMEOUT_SECS", 5)?,
            request_timeout: seconds(get("REQUEST_TIMEOUT_SECS"), "REQUEST_TIMEOUT_SECS", 30)?,
        };
        config.rate_limit_quota()?;
        Ok(config)
    }
}

impl Config {
    /// Token service for the configured secrets and lifetimes
    pub fn token_service(&self) -> Result<TokenService, ConfigError> {
        let access = chrono::Duration::from_std(self.access_token_ttl).map_err(|_| {
            ConfigError::Invalid {
                key: "ACCESS_TOKEN_TTL_SECS",
                value: self.access_token_ttl.as_secs().to_string(),
            }
        })?;
        let refresh = chrono::Duration::from_std(self.refresh_token_ttl).map_err(|_| {
            ConfigError::Invalid {
                key: "REFRESH_TOKEN_TTL_SECS",
                value: self.refresh_token_ttl.as_secs().to_string(),
            }
        })?;

        Ok(TokenService::with_durations(
            &self.jwt_secret,
            &self.refresh_secret,
            access,
            refresh,
        ))
    }

    /// Per-client quota: one request every `1 / rate` seconds, bursts up to
    /// `rate_limit_burst`
    pub fn rate_limit_quota(&self) -> Result<Quota, ConfigError> {
        let invalid_rate = || ConfigError::Invalid {
            key: "RATE_LIMIT_PER_SECOND",
            value: self.rate_limit_per_second.to_string(),
        };

        let period_nanos = (1e9 / self.rate_limit_per_second).round();
        if !(period_nanos >= 1.0 && period_nanos < u64::MAX as f64) {
            return Err(invalid_rate());
        }
        let burst = NonZeroU32::new(self.rate_limit_burst).ok_or(ConfigError::Invalid {
            key: "RATE_LIMIT_BURST",
            value: self.rate_limit_burst.to_string(),
        })?;

        Quota::with_period(Duration::from_nanos(period_nanos as u64))
            .map(|quota| quota.allow_burst(burst))
            .ok_or_else(invalid_rate)
    }
}

fn secret(
    value: Option<String>,
    key: &'static str,
    fallback: &str,
    production: bool,
) -> Result<String, ConfigError> {
    match value {
        Some(value) => Ok(value),
        None if production => Err(ConfigError::Missing(key)),
        None => {
            warn!("{} not set, using insecure development secret", key);
            Ok(fallback.to_string())
        }
    }
}

fn parse<T: std::str::FromStr>(
    value: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn positive<T>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + ToString,
{
    let parsed = parse(value, key, default)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid { key, value: parsed.to_string() });
    }
    Ok(parsed)
}

fn seconds(value: Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs = positive(value, key, default)?;
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::Invalid { key, value: secs.to_string() });
    }
    Ok(Duration::from_secs(secs))
}
