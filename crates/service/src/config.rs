//! Environment-driven configuration.
//!
//! Read once at startup; anything invalid is fatal before the process talks
//! to the broker.

use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use salesfeed_pipeline::{RetryPolicy, Schedule};

pub const DEFAULT_QUEUE: &str = "daily_sales_report";
pub const DEFAULT_PREFETCH: usize = 5;
/// Noon every day (seconds-first cron), in the reporting timezone.
pub const DEFAULT_CRON: &str = "0 0 12 * * *";
pub const DEFAULT_TZ: Tz = chrono_tz::Europe::Berlin;
pub const DEFAULT_BACKOFF_MS: &str = "1000,3000,10000,30000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

fn invalid(key: &'static str, message: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.to_string(),
    }
}

/// Typed process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker_url: String,
    pub queue_name: String,
    pub prefetch: usize,
    pub schedule: Schedule,
    pub tz: Tz,
    pub retry_policy: RetryPolicy,
    pub database_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value lookup (tests inject a map here).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let broker_url = lookup("BROKER_URL").ok_or(ConfigError::Missing("BROKER_URL"))?;
        let queue_name = lookup("REPORT_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        if queue_name.is_empty() {
            return Err(invalid("REPORT_QUEUE", "must be non-empty"));
        }

        let prefetch = match lookup("PREFETCH_COUNT") {
            Some(raw) => {
                let n: usize = raw.parse().map_err(|e| invalid("PREFETCH_COUNT", e))?;
                if n == 0 {
                    return Err(invalid("PREFETCH_COUNT", "must be at least 1"));
                }
                n
            }
            None => DEFAULT_PREFETCH,
        };

        let tz = match lookup("REPORT_TZ") {
            Some(raw) => Tz::from_str(&raw).map_err(|e| invalid("REPORT_TZ", e))?,
            None => DEFAULT_TZ,
        };

        let cron = lookup("REPORT_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string());
        let schedule = Schedule::parse(&cron, tz).map_err(|e| invalid("REPORT_CRON", e))?;

        let backoff_raw = lookup("RETRY_BACKOFF_MS").unwrap_or_else(|| DEFAULT_BACKOFF_MS.to_string());
        let backoff = backoff_raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| invalid("RETRY_BACKOFF_MS", format!("{part:?}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let max_attempts = lookup("RETRY_MAX_ATTEMPTS")
            .map(|raw| raw.parse::<u32>().map_err(|e| invalid("RETRY_MAX_ATTEMPTS", e)))
            .transpose()?;

        let retry_policy = RetryPolicy::new(backoff, max_attempts)
            .map_err(|e| invalid("RETRY_BACKOFF_MS", e))?;

        Ok(Self {
            broker_url,
            queue_name,
            prefetch,
            schedule,
            tz,
            retry_policy,
            database_url: lookup("DATABASE_URL"),
        })
    }
}
