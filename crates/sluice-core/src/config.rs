//! Configuration for the dispatcher.
//!
//! One struct, passed by value into component constructors. Can be built
//! from defaults, from `SLUICE_*` environment variables, or from a JSON file
//! using the camelCase option names (`batchSize`, `flushIntervalMs`, ...).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Max records read per scheduler cycle; also the coalescer size trigger.
    pub batch_size: usize,
    pub base_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub backoff_multiplier: f64,
    /// Empty cycles must span at least this long before backoff begins.
    pub idle_threshold_ms: u64,

    /// Number of broker-client handles.
    pub pool_size: usize,
    /// Outstanding unacknowledged sends allowed per handle.
    pub max_producer_buffer: usize,
    /// A send the broker has not answered within this long fails as a timeout.
    pub send_timeout_ms: u64,

    pub flush_interval_ms: u64,
    /// Hard cap on pending status updates; reaching it is an alerting condition.
    pub max_pending_updates: usize,

    pub consumer_instance_count: usize,
    pub consumer_poll_timeout_ms: u64,

    /// Store connections (used by SQL-backed ledgers).
    pub connection_pool_size: usize,

    pub topic: String,
    pub consumer_group: String,

    /// Retries allowed after the first attempt; records with
    /// `retry_count > max_retries` are dead letters and no longer dispatched.
    pub max_retries: u32,

    /// Upper bound for waiting on in-flight sends during shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            base_poll_interval_ms: 50,
            max_poll_interval_ms: 5_000,
            backoff_multiplier: 2.0,
            idle_threshold_ms: 0,
            pool_size: 4,
            max_producer_buffer: 256,
            send_timeout_ms: 30_000,
            flush_interval_ms: 200,
            max_pending_updates: 100_000,
            consumer_instance_count: 3,
            consumer_poll_timeout_ms: 250,
            connection_pool_size: 4,
            topic: "outbox".to_string(),
            consumer_group: "sluice".to_string(),
            max_retries: 5,
            drain_timeout_ms: 10_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl DispatcherConfig {
    /// Defaults overridden by `SLUICE_*` environment variables.
    ///
    /// Unset or unparsable variables keep the default.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        macro_rules! env_override {
            ($($field:ident => $key:literal),* $(,)?) => {
                $(
                    if let Some(v) = env_parse($key) {
                        c.$field = v;
                    }
                )*
            };
        }
        env_override!(
            batch_size => "SLUICE_BATCH_SIZE",
            base_poll_interval_ms => "SLUICE_BASE_POLL_INTERVAL_MS",
            max_poll_interval_ms => "SLUICE_MAX_POLL_INTERVAL_MS",
            backoff_multiplier => "SLUICE_BACKOFF_MULTIPLIER",
            idle_threshold_ms => "SLUICE_IDLE_THRESHOLD_MS",
            pool_size => "SLUICE_POOL_SIZE",
            max_producer_buffer => "SLUICE_MAX_PRODUCER_BUFFER",
            send_timeout_ms => "SLUICE_SEND_TIMEOUT_MS",
            flush_interval_ms => "SLUICE_FLUSH_INTERVAL_MS",
            max_pending_updates => "SLUICE_MAX_PENDING_UPDATES",
            consumer_instance_count => "SLUICE_CONSUMER_INSTANCE_COUNT",
            consumer_poll_timeout_ms => "SLUICE_CONSUMER_POLL_TIMEOUT_MS",
            connection_pool_size => "SLUICE_CONNECTION_POOL_SIZE",
            topic => "SLUICE_TOPIC",
            consumer_group => "SLUICE_CONSUMER_GROUP",
            max_retries => "SLUICE_MAX_RETRIES",
            drain_timeout_ms => "SLUICE_DRAIN_TIMEOUT_MS",
        );
        c
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Fail-fast validation of option values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        non_zero("batchSize", self.batch_size as u64)?;
        non_zero("basePollIntervalMs", self.base_poll_interval_ms)?;
        non_zero("poolSize", self.pool_size as u64)?;
        non_zero("maxProducerBuffer", self.max_producer_buffer as u64)?;
        non_zero("sendTimeoutMs", self.send_timeout_ms)?;
        non_zero("flushIntervalMs", self.flush_interval_ms)?;
        non_zero("connectionPoolSize", self.connection_pool_size as u64)?;
        non_zero("consumerPollTimeoutMs", self.consumer_poll_timeout_ms)?;
        non_zero("maxRetries", u64::from(self.max_retries))?;

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "backoffMultiplier",
                reason: format!("must be >= 1.0, got {}", self.backoff_multiplier),
            });
        }
        if self.max_poll_interval_ms < self.base_poll_interval_ms {
            return Err(ConfigError::Invalid {
                field: "maxPollIntervalMs",
                reason: "must be >= basePollIntervalMs".to_string(),
            });
        }
        if self.max_pending_updates < self.batch_size {
            return Err(ConfigError::Invalid {
                field: "maxPendingUpdates",
                reason: "must be >= batchSize".to_string(),
            });
        }
        if self.topic.is_empty() || self.consumer_group.is_empty() {
            return Err(ConfigError::Invalid {
                field: "topic",
                reason: "topic and consumerGroup must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn base_poll_interval(&self) -> Duration {
        Duration::from_millis(self.base_poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn consumer_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Max sends outstanding across the whole pool.
    pub fn pool_capacity(&self) -> usize {
        self.pool_size.saturating_mul(self.max_producer_buffer)
    }

    /// Max ids the scheduler keeps between submit and the `Produced` flush:
    /// a full pool plus two batches of acked-but-unflushed ids.
    pub fn dispatch_window(&self) -> usize {
        self.pool_capacity()
            .saturating_add(self.batch_size.saturating_mul(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let config = DispatcherConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.flush_interval(), Duration::from_millis(200));
        assert_eq!(config.pool_capacity(), 4 * 256);
        assert_eq!(config.dispatch_window(), 4 * 256 + 2 * 500);
        assert_eq!(config.send_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn json_uses_option_names() {
        let config = DispatcherConfig::from_json_str(
            r#"{"batchSize": 100, "flushIntervalMs": 50, "poolSize": 2, "consumerInstanceCount": 6}"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.flush_interval_ms, 50);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.consumer_instance_count, 6);
        // untouched options keep defaults
        assert_eq!(config.max_producer_buffer, 256);
    }

    #[rstest]
    #[case::zero_batch(r#"{"batchSize": 0}"#, "batchSize")]
    #[case::zero_pool(r#"{"poolSize": 0}"#, "poolSize")]
    #[case::zero_send_timeout(r#"{"sendTimeoutMs": 0}"#, "sendTimeoutMs")]
    #[case::shrinking_backoff(r#"{"backoffMultiplier": 0.5}"#, "backoffMultiplier")]
    #[case::max_below_base(r#"{"basePollIntervalMs": 100, "maxPollIntervalMs": 10}"#, "maxPollIntervalMs")]
    #[case::cap_below_batch(r#"{"batchSize": 1000, "maxPendingUpdates": 10}"#, "maxPendingUpdates")]
    fn invalid_values_are_rejected(#[case] json: &str, #[case] expected_field: &str) {
        match DispatcherConfig::from_json_str(json) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected Invalid({expected_field}), got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            DispatcherConfig::from_json_str("{"),
            Err(ConfigError::Json(_))
        ));
    }
}
