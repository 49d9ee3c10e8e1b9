use crate::Lsn;

/// Tag stored with every record; recovery scans recognize checkpoint
/// markers by it, and the replication layer acknowledges records whose
/// type requires durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordType {
    /// Ordinary operation record
    Data = 1,
    /// Transaction commit boundary
    Commit = 2,
    /// Checkpoint marker
    Checkpoint = 3,
}

impl RecordType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RecordType::Data),
            2 => Some(RecordType::Commit),
            3 => Some(RecordType::Checkpoint),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Commit and checkpoint records must be acknowledged by remote sites
    /// before the caller's durability requirement can be met.
    pub fn needs_ack(self) -> bool {
        matches!(self, RecordType::Commit | RecordType::Checkpoint)
    }
}

/// A decoded log record: the LSN it was read from, its type tag, and the
/// opaque payload. Handed out by the store as a read-only view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    lsn: Lsn,
    rec_type: RecordType,
    payload: Vec<u8>,
}

impl LogRecord {
    pub(crate) fn new(lsn: Lsn, rec_type: RecordType, payload: Vec<u8>) -> Self {
        Self {
            lsn,
            rec_type,
            payload,
        }
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn rec_type(&self) -> RecordType {
        self.rec_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes this record occupies on disk, length prefix included.
    pub fn frame_len(&self) -> u32 {
        crate::constants::RECORD_FRAME_OVERHEAD + self.payload.len() as u32
    }
}
