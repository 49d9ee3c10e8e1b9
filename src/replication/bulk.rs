use crate::metrics::BULK_TRANSFERS;
use crate::Lsn;
use crate::NetworkError;
use crate::RepMessage;
use crate::Result;

/// Per-record overhead inside a bulk buffer: length prefix plus LSN.
const BULK_ENTRY_OVERHEAD: usize = 12;

/// Byte-ceiling accumulator batching small records into one wire message.
/// Entries are framed `{len, lsn, body}`; a record larger than the whole
/// buffer bypasses batching and goes out as a singleton.
pub(crate) struct BulkBuffer {
    buf: Vec<u8>,
    ceiling: usize,
    max_records: u32,
    first_lsn: Lsn,
    records: u32,
    flags: u32,
}

impl BulkBuffer {
    pub fn new(ceiling: u32, max_records: u32) -> Self {
        Self {
            buf: Vec::with_capacity(ceiling as usize),
            ceiling: ceiling as usize,
            max_records,
            first_lsn: Lsn::ZERO,
            records: 0,
            flags: 0,
        }
    }

    /// True when the record can never fit, even in an empty buffer.
    pub fn oversize(&self, body_len: usize) -> bool {
        BULK_ENTRY_OVERHEAD + body_len > self.ceiling
    }

    /// True when the record fits behind what is already buffered.
    pub fn fits(&self, body_len: usize) -> bool {
        self.buf.len() + BULK_ENTRY_OVERHEAD + body_len <= self.ceiling
            && self.records < self.max_records
    }

    /// Appends one record body. The caller has checked `fits`.
    pub fn push(&mut self, lsn: Lsn, body: &[u8], flags: u32) {
        if self.buf.is_empty() {
            self.first_lsn = lsn;
        }
        self.buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(&lsn.to_be_bytes());
        self.buf.extend_from_slice(body);
        self.records += 1;
        self.flags |= flags;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drains the buffer into one bulk message, resetting it for reuse.
    pub fn take(&mut self) -> Option<RepMessage> {
        if self.buf.is_empty() {
            return None;
        }
        BULK_TRANSFERS.inc();
        let msg = RepMessage::BulkLog {
            first_lsn: self.first_lsn,
            flags: self.flags,
            payload: std::mem::take(&mut self.buf),
        };
        self.first_lsn = Lsn::ZERO;
        self.records = 0;
        self.flags = 0;
        Some(msg)
    }
}

/// Splits a received bulk payload back into `(lsn, body)` entries.
pub(crate) fn split_bulk(payload: &[u8]) -> Result<Vec<(Lsn, &[u8])>> {
    let mut entries = Vec::new();
    let mut off = 0usize;
    while off < payload.len() {
        if off + BULK_ENTRY_OVERHEAD > payload.len() {
            return Err(NetworkError::BadFrame("truncated bulk entry header".into()).into());
        }
        let len = u32::from_be_bytes(payload[off..off + 4].try_into().unwrap()) as usize;
        let lsn = Lsn::from_be_bytes(payload[off + 4..off + 12].try_into().unwrap());
        off += BULK_ENTRY_OVERHEAD;
        if off + len > payload.len() {
            return Err(NetworkError::BadFrame("truncated bulk entry body".into()).into());
        }
        entries.push((lsn, &payload[off..off + len]));
        off += len;
    }
    Ok(entries)
}
