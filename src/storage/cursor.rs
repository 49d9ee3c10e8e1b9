use super::LogRecord;
use super::LogStore;
use super::Lsn;
use crate::Result;

/// Cursor-style stepping over a log store, in the shape recovery scans and
/// the replication engine's streaming loops want: position once, then walk
/// with `next`/`prev`.
pub struct LogCursor<'a> {
    store: &'a LogStore,
    pos: Option<Lsn>,
}

impl<'a> LogCursor<'a> {
    pub(crate) fn new(store: &'a LogStore) -> Self {
        Self { store, pos: None }
    }

    /// Current position, if the cursor has one.
    pub fn position(&self) -> Option<Lsn> {
        self.pos
    }

    /// Positions on the first retained record.
    pub fn first(&mut self) -> Result<LogRecord> {
        self.load(self.store.first_lsn())
    }

    /// Positions on the last record.
    pub fn last(&mut self) -> Result<LogRecord> {
        let head = self.store.head_lsn();
        let lsn = self.store.prev(head)?;
        self.load(lsn)
    }

    /// Positions on an exact LSN.
    pub fn set(&mut self, lsn: Lsn) -> Result<LogRecord> {
        self.load(lsn)
    }

    /// Steps forward, transparently crossing into the next file.
    pub fn next(&mut self) -> Result<LogRecord> {
        match self.pos {
            Some(pos) => {
                let lsn = self.store.next(pos)?;
                self.load(lsn)
            }
            None => self.first(),
        }
    }

    /// Steps backward, crossing into the previous file at a file start.
    pub fn prev(&mut self) -> Result<LogRecord> {
        match self.pos {
            Some(pos) => {
                let lsn = self.store.prev(pos)?;
                self.load(lsn)
            }
            None => self.last(),
        }
    }

    fn load(&mut self, lsn: Lsn) -> Result<LogRecord> {
        let record = self.store.read(lsn)?;
        self.pos = Some(lsn);
        Ok(record)
    }
}
