// -
// On-disk log format

/// Magic number at the start of every log file header.
pub(crate) const LOG_MAGIC: u32 = 0x5741_4C03;

/// Current on-disk log format version.
pub(crate) const LOG_VERSION: u32 = 1;

/// Oldest on-disk format version we can still read.
pub(crate) const LOG_OLDEST_VERSION: u32 = 1;

/// Fixed log file header: magic, version, mode, max file size.
pub(crate) const LOG_FILE_HEADER_SIZE: u32 = 16;

/// Per-record frame overhead: length prefix plus record-type tag.
pub(crate) const RECORD_FRAME_OVERHEAD: u32 = 8;

/// Log file name prefix; files are `log.NNNNNNNNNN`.
pub(crate) const LOG_FILE_PREFIX: &str = "log.";

// -
// Wire protocol

/// Version tag carried in every handshake and replication control.
pub(crate) const WIRE_VERSION: u32 = 1;

/// Fixed frame header: type byte plus two big-endian length fields.
pub(crate) const FRAME_HEADER_SIZE: usize = 9;
