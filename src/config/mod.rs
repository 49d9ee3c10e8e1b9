//! Configuration for the replicated log subsystem.
//!
//! Settings are deserialized from TOML with defaults for every field, then
//! validated before the subsystem starts. The embedding engine supplies the
//! site list, durability policy and log-store tuning here.

mod log;
mod replication;
mod retry;
mod transport;
pub use log::*;
pub use replication::*;
pub use retry::*;
pub use transport::*;


//---
use crate::Result;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// File-backed log store tuning
    #[serde(default)]
    pub log: LogSettings,

    /// Log-shipping and durability parameters
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Listener address, site list and queue limits
    #[serde(default)]
    pub transport: TransportSettings,

    /// Retry policies for connection management
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl Settings {
    /// Load configuration from an optional TOML file with environment
    /// variables (prefix `WALREP`, `__` separator) as the highest priority.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = Config::builder();

        if let Some(path) = path {
            config = config.add_source(File::with_name(path).required(true));
        }

        config = config.add_source(
            Environment::with_prefix("WALREP")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = config.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates all subsystem configurations
    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        self.replication.validate()?;
        self.transport.validate()?;
        Ok(())
    }
}
