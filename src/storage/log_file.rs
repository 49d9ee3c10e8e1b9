use std::path::Path;
use std::path::PathBuf;

use crate::constants::LOG_FILE_HEADER_SIZE;
use crate::constants::LOG_FILE_PREFIX;
use crate::constants::LOG_MAGIC;
use crate::constants::LOG_OLDEST_VERSION;
use crate::constants::LOG_VERSION;
use crate::StorageError;

/// Fixed header at the start of every log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogFileHeader {
    pub magic: u32,
    pub version: u32,
    pub mode: u32,
    pub max_file_size: u32,
}

impl LogFileHeader {
    pub fn new(mode: u32, max_file_size: u32) -> Self {
        Self {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            mode,
            max_file_size,
        }
    }

    pub fn encode(&self) -> [u8; LOG_FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; LOG_FILE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..12].copy_from_slice(&self.mode.to_be_bytes());
        buf[12..16].copy_from_slice(&self.max_file_size.to_be_bytes());
        buf
    }

    pub fn decode(file: u32, buf: &[u8]) -> Result<Self, StorageError> {
        if buf.len() < LOG_FILE_HEADER_SIZE as usize {
            return Err(StorageError::Corrupt {
                file,
                reason: format!("short header: {} bytes", buf.len()),
            });
        }
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != LOG_MAGIC {
            return Err(StorageError::Corrupt {
                file,
                reason: format!("bad magic {:#010x}", magic),
            });
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if !(LOG_OLDEST_VERSION..=LOG_VERSION).contains(&version) {
            return Err(StorageError::VersionMismatch { file, version });
        }
        Ok(Self {
            magic,
            version,
            mode: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            max_file_size: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// `log.NNNNNNNNNN` path for a file number.
pub(crate) fn log_file_path(dir: &Path, file: u32) -> PathBuf {
    dir.join(format!("{}{:010}", LOG_FILE_PREFIX, file))
}

/// Parses the file number out of a `log.NNNNNNNNNN` name.
pub(crate) fn parse_file_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(LOG_FILE_PREFIX)?;
    if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
