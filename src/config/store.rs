use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Store configuration.
///
/// The store holds every piece of shared state: API keys, upstream accounts,
/// rate windows, concurrency leases, queue counters, sticky sessions, and
/// usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum StoreConfig {
    /// In-memory store. Single-node only: admission state is per-process,
    /// so limits are enforced per node rather than globally.
    Memory,

    /// Redis store. Required for multi-node deployments.
    Redis(RedisStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Redis(RedisStoreConfig::default())
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StoreConfig::Memory => Ok(()),
            StoreConfig::Redis(c) => c.validate(),
        }
    }
}

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisStoreConfig {
    /// Redis connection URL.
    /// Format: redis://[user:password@]host:port[/database]
    /// For clusters: comma-separated host:port pairs.
    pub url: String,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Cluster mode configuration.
    #[serde(default)]
    pub cluster: Option<RedisClusterConfig>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout_secs: default_connect_timeout(),
            cluster: None,
        }
    }
}

impl RedisStoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Validation("Redis URL cannot be empty".into()));
        }
        Ok(())
    }
}

/// Redis cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisClusterConfig {
    /// Read from replicas for read operations.
    #[serde(default)]
    pub read_from_replicas: bool,

    /// Number of retries for cluster operations.
    #[serde(default = "default_cluster_retries")]
    pub retries: u32,

    /// Connection timeout for cluster nodes in seconds.
    #[serde(default = "default_cluster_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Response timeout for cluster operations in seconds.
    #[serde(default = "default_cluster_response_timeout")]
    pub response_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_cluster_retries() -> u32 {
    3
}

fn default_cluster_connection_timeout() -> u64 {
    5
}

fn default_cluster_response_timeout() -> u64 {
    1
}
