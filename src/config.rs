use anyhow::Context;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::services::{RetryPolicy, SchedulerConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub settlement_url: String,
    pub settlement_timeout_secs: u64,
    pub settlement_breaker_failures: u32,
    pub settlement_breaker_reset_secs: u64,
    pub scheduler_poll_interval_secs: u64,
    pub scheduler_batch_size: i64,
    pub worker_concurrency: usize,
    pub withdrawal_max_retries: i32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub wallet_lock_timeout_ms: u64,
    pub stale_processing_secs: u64,
}

fn var_or<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{} is not valid", key))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        let settlement_url = env::var("SETTLEMENT_URL").context("SETTLEMENT_URL must be set")?;
        Url::parse(&settlement_url).context("SETTLEMENT_URL is not a valid URL")?;

        Ok(Config {
            server_port: var_or("SERVER_PORT", "3000")?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: var_or("DATABASE_MAX_CONNECTIONS", "10")?,
            settlement_url,
            settlement_timeout_secs: var_or("SETTLEMENT_TIMEOUT_SECS", "10")?,
            settlement_breaker_failures: var_or("SETTLEMENT_BREAKER_FAILURES", "5")?,
            settlement_breaker_reset_secs: var_or("SETTLEMENT_BREAKER_RESET_SECS", "30")?,
            scheduler_poll_interval_secs: var_or("SCHEDULER_POLL_INTERVAL_SECS", "10")?,
            scheduler_batch_size: var_or("SCHEDULER_BATCH_SIZE", "100")?,
            worker_concurrency: var_or("WORKER_CONCURRENCY", "16")?,
            withdrawal_max_retries: var_or("WITHDRAWAL_MAX_RETRIES", "3")?,
            retry_base_delay_secs: var_or("RETRY_BASE_DELAY_SECS", "30")?,
            retry_max_delay_secs: var_or("RETRY_MAX_DELAY_SECS", "600")?,
            wallet_lock_timeout_ms: var_or("WALLET_LOCK_TIMEOUT_MS", "5000")?,
            stale_processing_secs: var_or("STALE_PROCESSING_SECS", "300")?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.withdrawal_max_retries,
            Duration::from_secs(self.retry_base_delay_secs),
            Duration::from_secs(self.retry_max_delay_secs),
        )
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.scheduler_poll_interval_secs.max(1)),
            batch_size: self.scheduler_batch_size,
            worker_concurrency: self.worker_concurrency,
            stale_after: Duration::from_secs(self.stale_processing_secs),
        }
    }

    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement_timeout_secs)
    }

    pub fn wallet_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.wallet_lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server_port: 3000,
            database_url: "postgres://localhost/wallets".to_string(),
            database_max_connections: 10,
            settlement_url: "http://bank.local/settle".to_string(),
            settlement_timeout_secs: 10,
            settlement_breaker_failures: 5,
            settlement_breaker_reset_secs: 30,
            scheduler_poll_interval_secs: 0,
            scheduler_batch_size: 100,
            worker_concurrency: 16,
            withdrawal_max_retries: 3,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 600,
            wallet_lock_timeout_ms: 5000,
            stale_processing_secs: 300,
        }
    }

    #[test]
    fn test_derived_settings() {
        let config = sample();
        let retry = config.retry_policy();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(30));
        assert_eq!(retry.max_delay, Duration::from_secs(600));

        // A zero interval would make tokio's interval panic.
        assert_eq!(config.scheduler().poll_interval, Duration::from_secs(1));
        assert_eq!(config.wallet_lock_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_var_or_falls_back_to_default() {
        let port: u16 = var_or("WALLET_CORE_TEST_UNSET_PORT", "4000").unwrap();
        assert_eq!(port, 4000);
    }
}
