//! Typed configuration for the control plane.
//!
//! Every section carries serde defaults so an empty document is a valid
//! configuration. Loading (files, environment, CLI) is the embedding
//! application's concern; this crate only defines the shapes and validates
//! them.

mod admission;
mod scheduler;
mod store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use admission::{AccountingConfig, AdmissionConfig, QueueConfig};
pub use scheduler::SchedulerConfig;
pub use store::{RedisClusterConfig, RedisStoreConfig, StoreConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub accounting: AccountingConfig,
}

impl ControlPlaneConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.admission.validate()?;
        self.scheduler.validate()?;
        self.accounting.validate()?;
        Ok(())
    }
}
