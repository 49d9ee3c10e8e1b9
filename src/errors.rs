//! Error hierarchy for the replicated log subsystem.
//!
//! Errors are categorized by layer: storage (the file-backed log), network
//! (site connections and the framed transport), and replication (the
//! log-shipping protocol itself).

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failures of the file-backed log store
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Socket-level and transport failures
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Log-shipping protocol failures
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures during log operations
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Bad magic or malformed header in a log file
    #[error("log file {file} is corrupt: {reason}")]
    Corrupt { file: u32, reason: String },

    /// Log file format version newer than this build supports
    #[error("log file {file} has unsupported format version {version}")]
    VersionMismatch { file: u32, version: u32 },

    /// The requested LSN does not exist locally
    #[error("no record at [{file}][{offset}]")]
    NotFound { file: u32, offset: u32 },

    /// A single record cannot fit in any log file
    #[error("record of {size} bytes exceeds the log file size ceiling")]
    RecordTooLarge { size: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Site unreachable, queue overrun, or connection busted
    #[error("site {eid} unavailable")]
    Unavailable { eid: u32 },

    /// No connected site can satisfy the request
    #[error("no site available for {request}")]
    NoSiteAvailable { request: &'static str },

    /// Remote speaks a newer wire protocol than we do
    #[error("mismatched wire protocol version {remote} (ours: {ours})")]
    VersionMismatch { remote: u32, ours: u32 },

    /// Malformed frame from a remote site
    #[error("bad frame from remote: {0}")]
    BadFrame(String),

    /// Frame length field exceeds the configured ceiling
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Address resolution produced no usable addresses
    #[error("cannot resolve {host}:{port}")]
    UnresolvedAddress { host: String, port: u16 },

    /// Peer closed the connection
    #[error("EOF on connection to site {eid}")]
    Eof { eid: u32 },

    /// Durability wait expired before enough sites acknowledged
    #[error("acknowledgement wait timed out at [{file}][{offset}]")]
    AckTimeout { file: u32, offset: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// A requester asked for records before our oldest retained file.
    /// The requester is too far behind and must resynchronize by a
    /// full-copy mechanism outside this subsystem.
    #[error("requester is outdated; oldest retained record is [{file}][{offset}]")]
    OutdatedRequester { file: u32, offset: u32 },

    /// The remote primary told us our log diverged beyond repair
    #[error("local log is outdated at [{file}][{offset}]; full resync required")]
    OutdatedClient { file: u32, offset: u32 },

    /// The primary could not serve one of its own log records
    #[error("primary cannot serve its own record at [{file}][{offset}]")]
    PrimaryLogBroken { file: u32, offset: u32 },

    /// Message decoded to a kind this node does not handle
    #[error("unknown replication message type {0}")]
    UnknownMessageType(u32),
}

// ============== Conversion Implementations ============== //
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(StorageError::Io(e))
    }
}
