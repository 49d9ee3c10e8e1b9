use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// How many remote acknowledgements make a record durable.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Never wait for acknowledgements
    None,
    /// Any one site
    One,
    /// Any one electable peer
    OnePeer,
    /// A majority of the group, counting ourselves
    #[default]
    Quorum,
    /// Every site in the group
    All,
    /// Every electable peer in the group
    AllPeers,
}

/// Log-shipping and durability parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplicationSettings {
    /// Total number of sites in the group, including this one; drives the
    /// quorum arithmetic
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    /// Durability requirement applied to needs-ack records
    #[serde(default)]
    pub ack_policy: AckPolicy,

    /// How long a durability wait may block before returning unavailable
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Byte ceiling of the bulk-batching accumulator; zero disables bulk
    /// transfer
    #[serde(default = "default_bulk_buffer_size")]
    pub bulk_buffer_size: u32,

    /// Records allowed in one bulk buffer before it is flushed regardless
    /// of fill level
    #[serde(default = "default_bulk_max_records")]
    pub bulk_max_records: u32,

    /// Byte budget for one streaming burst before the sender yields with a
    /// log-more marker; zero disables throttling
    #[serde(default = "default_throttle_bytes")]
    pub throttle_bytes: u64,

    /// Look-ahead, in log bytes, applied when a log-more marker announces
    /// a burst of records that have not reached us yet
    #[serde(default = "default_gap_lookahead_bytes")]
    pub gap_lookahead_bytes: u32,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            ack_policy: AckPolicy::default(),
            ack_timeout_ms: default_ack_timeout(),
            bulk_buffer_size: default_bulk_buffer_size(),
            bulk_max_records: default_bulk_max_records(),
            throttle_bytes: default_throttle_bytes(),
            gap_lookahead_bytes: default_gap_lookahead_bytes(),
        }
    }
}

impl ReplicationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "group_size must be at least 1".into(),
            )));
        }
        if self.gap_lookahead_bytes == 0 {
            return Err(Error::Config(ConfigError::Message(
                "gap_lookahead_bytes must be greater than 0".into(),
            )));
        }
        if self.bulk_buffer_size > 0 && self.bulk_max_records == 0 {
            return Err(Error::Config(ConfigError::Message(
                "bulk_max_records must be greater than 0 when bulk is enabled".into(),
            )));
        }
        Ok(())
    }

    pub fn bulk_enabled(&self) -> bool {
        self.bulk_buffer_size > 0
    }
}

fn default_group_size() -> usize {
    1
}

fn default_ack_timeout() -> u64 {
    1_000
}

fn default_bulk_buffer_size() -> u32 {
    1024 * 1024
}

fn default_bulk_max_records() -> u32 {
    512
}

fn default_throttle_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_gap_lookahead_bytes() -> u32 {
    1024 * 1024
}
