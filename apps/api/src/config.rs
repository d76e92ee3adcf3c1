use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::enhancement::scheduler::DEFAULT_RETRY_QUEUE_KEY;

/// Which backend runs the enhancement jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Webhook,
    Anthropic,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "webhook" => Ok(Self::Webhook),
            "anthropic" => Ok(Self::Anthropic),
            other => bail!("unknown provider '{other}' (expected 'webhook' or 'anthropic')"),
        }
    }
}

/// Where scheduled drives wait until they are due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryQueueKind {
    Redis,
    Local,
}

impl FromStr for RetryQueueKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "local" => Ok(Self::Local),
            other => bail!("unknown retry queue '{other}' (expected 'redis' or 'local')"),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    /// Sent on outbound webhook dispatches and required on inbound callbacks.
    pub provider_shared_secret: String,
    pub provider: ProviderKind,
    pub provider_webhook_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    /// Overrides the Messages API URL (proxies, gateways).
    pub anthropic_api_url: Option<String>,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub dispatch_timeout: Duration,
    pub processing_timeout: Duration,
    pub retry_queue: RetryQueueKind,
    pub retry_queue_key: String,
    pub retry_poll_interval: Duration,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("Required environment variable '{key}' is not set"))
        };

        let provider: ProviderKind = parse_or(&lookup, "PROVIDER", ProviderKind::Webhook)?;
        let provider_webhook_url = lookup("PROVIDER_WEBHOOK_URL").filter(|v| !v.is_empty());
        let anthropic_api_key = lookup("ANTHROPIC_API_KEY").filter(|v| !v.is_empty());
        match provider {
            ProviderKind::Webhook if provider_webhook_url.is_none() => {
                bail!("PROVIDER_WEBHOOK_URL is required when PROVIDER=webhook")
            }
            ProviderKind::Anthropic if anthropic_api_key.is_none() => {
                bail!("ANTHROPIC_API_KEY is required when PROVIDER=anthropic")
            }
            _ => {}
        }

        let max_attempts: u32 = parse_or(&lookup, "MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }

        Ok(Config {
            database_url: require("DATABASE_URL")?,
            redis_url: require("REDIS_URL")?,
            s3_bucket: require("S3_BUCKET")?,
            s3_endpoint: require("S3_ENDPOINT")?,
            aws_access_key_id: require("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require("AWS_SECRET_ACCESS_KEY")?,
            provider_shared_secret: require("PROVIDER_SHARED_SECRET")?,
            provider,
            provider_webhook_url,
            anthropic_api_key,
            anthropic_api_url: lookup("ANTHROPIC_API_URL").filter(|v| !v.is_empty()),
            max_attempts,
            retry_base_delay: Duration::from_millis(parse_or(&lookup, "RETRY_BASE_MS", 1000)?),
            retry_max_delay: Duration::from_millis(parse_or(
                &lookup,
                "RETRY_MAX_DELAY_MS",
                60_000,
            )?),
            dispatch_timeout: Duration::from_secs(parse_or(&lookup, "DISPATCH_TIMEOUT_SECS", 30)?),
            processing_timeout: Duration::from_secs(parse_or(
                &lookup,
                "PROCESSING_TIMEOUT_SECS",
                600,
            )?),
            retry_queue: parse_or(&lookup, "RETRY_QUEUE", RetryQueueKind::Redis)?,
            retry_queue_key: lookup("RETRY_QUEUE_KEY")
                .unwrap_or_else(|| DEFAULT_RETRY_QUEUE_KEY.to_string()),
            retry_poll_interval: Duration::from_millis(parse_or(&lookup, "RETRY_POLL_MS", 250)?),
            port: parse_or(&lookup, "PORT", 8080)?,
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Parses `key` if set, falling back to `default` when unset or blank.
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} has an invalid value '{raw}': {e}")),
    }
}
