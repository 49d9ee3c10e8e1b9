use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// One remote site from the static group configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SiteEntry {
    pub host: String,
    pub port: u16,
}

/// Listener address, site list and per-connection queue limits
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportSettings {
    /// Hostname other sites reach us at; sent in the handshake
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Port we listen on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Election priority advertised in the handshake; 0 means this site is
    /// not electable
    #[serde(default)]
    pub priority: u32,

    /// Remote sites to connect to at startup
    #[serde(default)]
    pub sites: Vec<SiteEntry>,

    /// Messages allowed on one connection's outbound queue before further
    /// broadcast messages to it are dropped
    #[serde(default = "default_out_queue_limit")]
    pub out_queue_limit: usize,

    /// Ceiling on either length field of an inbound frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            priority: 0,
            sites: Vec::new(),
            out_queue_limit: default_out_queue_limit(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl TransportSettings {
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "listen_host cannot be empty".into(),
            )));
        }
        if self.out_queue_limit == 0 {
            return Err(Error::Config(ConfigError::Message(
                "out_queue_limit must be greater than 0".into(),
            )));
        }
        for site in &self.sites {
            if site.host.is_empty() {
                return Err(Error::Config(ConfigError::Message(
                    "site host cannot be empty".into(),
                )));
            }
        }
        Ok(())
    }
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    7780
}

fn default_out_queue_limit() -> usize {
    10
}

fn default_max_frame_size() -> usize {
    64 * 1024 * 1024
}
