use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::LOG_FILE_HEADER_SIZE;
use crate::constants::RECORD_FRAME_OVERHEAD;
use crate::Error;
use crate::Result;

/// When appended records are forced to stable storage.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// fsync after every append
    #[default]
    EveryWrite,
    /// fsync only on explicit flush (commit boundaries)
    Batched,
}

/// Tuning for the file-backed log store
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogSettings {
    /// Directory holding the numbered log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// Size ceiling per log file; appends rotate to a new file rather than
    /// cross it
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u32,

    /// fsync policy consumed by the store
    #[serde(default)]
    pub sync: SyncPolicy,

    /// Unix permission bits recorded in each file header
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            max_file_size: default_max_file_size(),
            sync: SyncPolicy::default(),
            file_mode: default_file_mode(),
        }
    }
}

impl LogSettings {
    pub fn validate(&self) -> Result<()> {
        // A file must hold its header plus at least one framed record byte.
        if self.max_file_size <= LOG_FILE_HEADER_SIZE + RECORD_FRAME_OVERHEAD {
            return Err(Error::Config(ConfigError::Message(format!(
                "max_file_size must exceed {} bytes",
                LOG_FILE_HEADER_SIZE + RECORD_FRAME_OVERHEAD
            ))));
        }
        Ok(())
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("walrep-logs")
}

fn default_max_file_size() -> u32 {
    10 * 1024 * 1024
}

fn default_file_mode() -> u32 {
    0o600
}
