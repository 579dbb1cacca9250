use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;

use crate::domain::TopicPattern;

/// Exponential backoff parameters shared by write retries and link
/// reconnection (independent attempt counters per user).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Delay before the given attempt (1-based), capped and jittered by
    /// +/-20% to avoid synchronized retries.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Static bridge configuration, read once at startup. Invalid values here
/// are the only fatal errors in the system.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bus_url: String,
    pub topic_pattern: TopicPattern,
    pub storage_url: String,
    pub database: String,
    pub collection: String,
    pub queue_capacity: usize,
    pub batch_max_size: usize,
    pub batch_max_wait: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_drain_timeout: Duration,
    pub health_probe_interval: Duration,
    pub dead_letter_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bus_url: "mqtt://127.0.0.1:1883".to_string(),
            topic_pattern: TopicPattern::parse("garbage/#")
                .unwrap_or_else(|_| unreachable!("default pattern is valid")),
            storage_url: "mongodb://127.0.0.1:27017".to_string(),
            database: "garbage_data".to_string(),
            collection: "sensor_data".to_string(),
            queue_capacity: 10_000,
            batch_max_size: 100,
            batch_max_wait: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            shutdown_drain_timeout: Duration::from_secs(10),
            health_probe_interval: Duration::from_secs(1),
            dead_letter_capacity: 1_000,
            retry: RetryConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Builds a config from `BRIDGE_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let topic_pattern = match std::env::var("BRIDGE_TOPIC_PATTERN") {
            Ok(raw) => TopicPattern::parse(&raw)
                .with_context(|| format!("invalid BRIDGE_TOPIC_PATTERN {:?}", raw))?,
            Err(_) => defaults.topic_pattern,
        };

        Ok(Self {
            bus_url: env_string("BRIDGE_BUS_URL", defaults.bus_url),
            topic_pattern,
            storage_url: env_string("BRIDGE_STORAGE_URL", defaults.storage_url),
            database: env_string("BRIDGE_DATABASE", defaults.database),
            collection: env_string("BRIDGE_COLLECTION", defaults.collection),
            queue_capacity: env_parse("BRIDGE_QUEUE_CAPACITY", defaults.queue_capacity)?,
            batch_max_size: env_parse("BRIDGE_BATCH_MAX_SIZE", defaults.batch_max_size)?,
            batch_max_wait: env_millis("BRIDGE_BATCH_MAX_WAIT_MS", defaults.batch_max_wait)?,
            connect_timeout: env_millis("BRIDGE_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            write_timeout: env_millis("BRIDGE_WRITE_TIMEOUT_MS", defaults.write_timeout)?,
            shutdown_drain_timeout: env_millis(
                "BRIDGE_SHUTDOWN_DRAIN_TIMEOUT_MS",
                defaults.shutdown_drain_timeout,
            )?,
            health_probe_interval: env_millis(
                "BRIDGE_HEALTH_PROBE_INTERVAL_MS",
                defaults.health_probe_interval,
            )?,
            dead_letter_capacity: env_parse(
                "BRIDGE_DEAD_LETTER_CAPACITY",
                defaults.dead_letter_capacity,
            )?,
            retry: RetryConfig {
                base_delay: env_millis("BRIDGE_RETRY_BASE_DELAY_MS", defaults.retry.base_delay)?,
                multiplier: env_parse("BRIDGE_RETRY_MULTIPLIER", defaults.retry.multiplier)?,
                max_delay: env_millis("BRIDGE_RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
                max_attempts: env_parse("BRIDGE_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            },
        })
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(
        key,
        default.as_millis() as u64,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable() {
        let config = BridgeConfig::default();
        assert!(config.topic_pattern.matches("garbage/bin7"));
        assert_eq!(config.database, "garbage_data");
        assert_eq!(config.collection, "sensor_data");
        assert!(config.queue_capacity > 0);
    }

    #[test]
    fn retry_delay_grows_and_stays_capped() {
        let retry = RetryConfig {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            max_attempts: 10,
        };

        // Jitter is +/-20%, so compare against generous bounds.
        let first = retry.delay_for(1);
        assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));

        let third = retry.delay_for(3);
        assert!(third >= Duration::from_millis(320) && third <= Duration::from_millis(480));

        let late = retry.delay_for(30);
        assert!(late <= Duration::from_millis(1200));
    }
}
