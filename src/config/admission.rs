use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Admission engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Required prefix on raw API keys. Anything else is rejected before the
    /// store is consulted.
    #[serde(default = "default_api_key_prefix")]
    pub api_key_prefix: String,

    /// Fixed timezone offset (hours east of UTC) used for all date, month,
    /// hour and week bucketing. Cost limit resets follow this clock.
    #[serde(default = "default_timezone_offset")]
    pub timezone_offset_hours: i32,

    /// Default concurrency lease in seconds when the caller supplies none.
    /// A lease bounds how long a crashed forwarder can pin a slot.
    #[serde(default = "default_lease_seconds")]
    pub default_lease_seconds: u64,

    /// Queue waiter tuning.
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            api_key_prefix: default_api_key_prefix(),
            timezone_offset_hours: default_timezone_offset(),
            default_lease_seconds: default_lease_seconds(),
            queue: QueueConfig::default(),
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "api_key_prefix cannot be empty".into(),
            ));
        }
        if !(-23..=23).contains(&self.timezone_offset_hours) {
            return Err(ConfigError::Validation(format!(
                "timezone_offset_hours must be within -23..=23, got {}",
                self.timezone_offset_hours
            )));
        }
        self.queue.validate()
    }
}

/// Queue waiter configuration.
///
/// A request that misses a concurrency slot waits here, polling with
/// jittered exponential backoff until a slot frees, the deadline passes, or
/// the caller cancels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Wait deadline when the API key does not override it. Keys with a
    /// non-positive override also fall back to this value.
    #[serde(default = "default_queue_timeout_ms")]
    pub default_timeout_ms: u64,

    /// First poll interval.
    #[serde(default = "default_initial_poll_ms")]
    pub initial_poll_ms: u64,

    /// Poll interval ceiling.
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_ms: u64,

    /// Multiplier applied to the poll interval after every miss.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Uniform jitter applied to each sleep, as a fraction of the interval.
    /// 0.2 means each sleep is drawn from [0.8, 1.2] x interval.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Queue health threshold: the queue is healthy while the global p90
    /// wait stays under `threshold x timeout`.
    #[serde(default = "default_health_threshold")]
    pub health_threshold: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_queue_timeout_ms(),
            initial_poll_ms: default_initial_poll_ms(),
            max_poll_ms: default_max_poll_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
            health_threshold: default_health_threshold(),
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "queue default_timeout_ms must be positive".into(),
            ));
        }
        if self.initial_poll_ms == 0 || self.max_poll_ms < self.initial_poll_ms {
            return Err(ConfigError::Validation(
                "queue poll intervals must satisfy 0 < initial_poll_ms <= max_poll_ms".into(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "queue backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::Validation(
                "queue jitter_ratio must be within [0, 1)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health_threshold) {
            return Err(ConfigError::Validation(
                "queue health_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Usage accounting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountingConfig {
    /// Window of the system-wide per-minute metrics view. Minute hashes are
    /// written with twice this TTL so a full window is always readable.
    #[serde(default = "default_metrics_window_secs")]
    pub metrics_window_secs: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            metrics_window_secs: default_metrics_window_secs(),
        }
    }
}

impl AccountingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_window_secs == 0 {
            return Err(ConfigError::Validation(
                "metrics_window_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_api_key_prefix() -> String {
    "cr_".to_string()
}

fn default_timezone_offset() -> i32 {
    8
}

fn default_lease_seconds() -> u64 {
    300
}

fn default_queue_timeout_ms() -> u64 {
    10_000
}

fn default_initial_poll_ms() -> u64 {
    200
}

fn default_max_poll_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_health_threshold() -> f64 {
    0.8
}

fn default_metrics_window_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdmissionConfig::default();
        assert_eq!(config.api_key_prefix, "cr_");
        assert_eq!(config.timezone_offset_hours, 8);
        assert_eq!(config.default_lease_seconds, 300);
        assert_eq!(config.queue.default_timeout_ms, 10_000);
        assert_eq!(config.queue.initial_poll_ms, 200);
        assert_eq!(config.queue.max_poll_ms, 2_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = AdmissionConfig {
            queue: QueueConfig {
                default_timeout_ms: 0,
                ..QueueConfig::default()
            },
            ..AdmissionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_poll_bounds() {
        let config = QueueConfig {
            initial_poll_ms: 3_000,
            max_poll_ms: 2_000,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
