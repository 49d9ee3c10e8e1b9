use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::log_file_path;
use super::parse_file_number;
use super::LogCursor;
use super::LogFileHeader;
use super::LogRecord;
use super::Lsn;
use super::RecordType;
use crate::config::LogSettings;
use crate::config::SyncPolicy;
use crate::constants::LOG_FILE_HEADER_SIZE;
use crate::constants::RECORD_FRAME_OVERHEAD;
use crate::Result;
use crate::StorageError;

/// What a startup scan of the log directory established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// One past the last good record
    pub head: Lsn,
    /// Last checkpoint marker seen in the newest (or second-newest) file
    pub checkpoint: Option<Lsn>,
}

struct Tail {
    file: File,
    /// Next append position; also the exclusive upper bound for reads
    head: Lsn,
    checkpoint: Option<Lsn>,
    oldest_file: u32,
}

/// Append-only, file-segmented log store.
///
/// The tail lock covers only the rotation decision and head-LSN updates;
/// record I/O happens outside it at the reserved offset. Reads go through
/// a small cached handle for the most recently read file.
pub struct LogStore {
    dir: PathBuf,
    settings: LogSettings,
    tail: Mutex<Tail>,
    read_cache: Mutex<Option<(u32, File)>>,
}

impl LogStore {
    /// Opens the store, scanning existing files to re-establish the head
    /// LSN and last checkpoint. Errors here are fatal to startup.
    pub fn open(settings: LogSettings) -> Result<Self> {
        fs::create_dir_all(&settings.dir)?;

        let mut files = Self::list_files(&settings.dir)?;
        loop {
            let Some(&newest) = files.last() else {
                let store = Self::create_fresh(settings)?;
                return Ok(store);
            };

            let path = log_file_path(&settings.dir, newest);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let mut header_buf = [0u8; LOG_FILE_HEADER_SIZE as usize];
            match file.read_exact_at(&mut header_buf, 0) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // A crash between creating a file and writing its header
                    // leaves an empty remnant; discard it and step back.
                    warn!("discarding headerless log remnant {:?}", path);
                    drop(file);
                    fs::remove_file(&path)?;
                    files.pop();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            LogFileHeader::decode(newest, &header_buf)?;

            let (end, mut checkpoint) = Self::scan_file(&file, newest)?;
            if checkpoint.is_none() && files.len() >= 2 {
                let prior = files[files.len() - 2];
                let prior_file = File::open(log_file_path(&settings.dir, prior))?;
                let (_, prior_ckp) = Self::scan_file(&prior_file, prior)?;
                checkpoint = prior_ckp;
            }

            // Drop any torn trailing record so the next append starts clean.
            file.set_len(end as u64)?;

            let head = Lsn::new(newest, end);
            info!("log recovered: head {} checkpoint {:?}", head, checkpoint);
            return Ok(Self {
                dir: settings.dir.clone(),
                tail: Mutex::new(Tail {
                    file,
                    head,
                    checkpoint,
                    oldest_file: files[0],
                }),
                read_cache: Mutex::new(None),
                settings,
            });
        }
    }

    fn create_fresh(settings: LogSettings) -> Result<Self> {
        let file = Self::create_file(&settings, 1)?;
        let head = Lsn::new(1, LOG_FILE_HEADER_SIZE);
        info!("log initialized: head {}", head);
        Ok(Self {
            dir: settings.dir.clone(),
            tail: Mutex::new(Tail {
                file,
                head,
                checkpoint: None,
                oldest_file: 1,
            }),
            read_cache: Mutex::new(None),
            settings,
        })
    }

    /// Appends one record and returns the LSN it was written at. Rotates
    /// to a new file first when the record would cross the size ceiling,
    /// so a record is never split across files.
    pub fn append(&self, rec_type: RecordType, payload: &[u8]) -> Result<Lsn> {
        let frame_len = RECORD_FRAME_OVERHEAD as u64 + payload.len() as u64;
        let capacity = self.settings.max_file_size as u64 - LOG_FILE_HEADER_SIZE as u64;
        if frame_len > capacity {
            return Err(StorageError::RecordTooLarge {
                size: payload.len(),
            }
            .into());
        }

        let (lsn, file) = {
            let mut tail = self.tail.lock();
            if tail.head.offset as u64 + frame_len > self.settings.max_file_size as u64 {
                self.rotate(&mut tail)?;
            }
            let lsn = tail.head;
            tail.head.offset += frame_len as u32;
            if rec_type == RecordType::Checkpoint {
                tail.checkpoint = Some(lsn);
            }
            (lsn, tail.file.try_clone()?)
        };

        let mut buf = Vec::with_capacity(frame_len as usize);
        buf.extend_from_slice(&(4 + payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&rec_type.as_u32().to_be_bytes());
        buf.extend_from_slice(payload);
        file.write_all_at(&buf, lsn.offset as u64)?;
        if self.settings.sync == SyncPolicy::EveryWrite {
            file.sync_data()?;
        }
        Ok(lsn)
    }

    /// Replica-side apply: writes a record at exactly `lsn`, which must be
    /// the current head (records reach the store in LSN order through the
    /// gap tracker). The size ceiling does not apply here; the sender's
    /// rotation points, announced as new-file markers, do.
    pub fn apply_record(&self, lsn: Lsn, rec_type: RecordType, payload: &[u8]) -> Result<()> {
        let frame_len = RECORD_FRAME_OVERHEAD as u64 + payload.len() as u64;
        let file = {
            let mut tail = self.tail.lock();
            if lsn != tail.head {
                return Err(crate::Error::Fatal(format!(
                    "record applied at {} but the log head is {}",
                    lsn, tail.head
                )));
            }
            tail.head.offset += frame_len as u32;
            if rec_type == RecordType::Checkpoint {
                tail.checkpoint = Some(lsn);
            }
            tail.file.try_clone()?
        };

        let mut buf = Vec::with_capacity(frame_len as usize);
        buf.extend_from_slice(&(4 + payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&rec_type.as_u32().to_be_bytes());
        buf.extend_from_slice(payload);
        file.write_all_at(&buf, lsn.offset as u64)?;
        if self.settings.sync == SyncPolicy::EveryWrite {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Replica-side rotation, driven by the sender's new-file marker
    /// rather than the local size ceiling.
    pub fn force_rotate(&self) -> Result<()> {
        let mut tail = self.tail.lock();
        self.rotate(&mut tail)
    }

    /// One past the last record of a sealed file: the position its reader
    /// reaches when the file is exhausted.
    pub fn end_of_file(&self, number: u32) -> Result<Lsn> {
        let last = self.last_in_file(number)?;
        let len = self.frame_len_at(last)?;
        Ok(Lsn::new(number, last.offset + len))
    }

    /// Reads the record at an exact LSN. `NotFound` past the head or for a
    /// file we no longer (or never) have.
    pub fn read(&self, lsn: Lsn) -> Result<LogRecord> {
        let head = self.head_lsn();
        if lsn >= head || lsn.offset < LOG_FILE_HEADER_SIZE {
            return Err(self.not_found(lsn));
        }
        let file = self.reader_for(lsn.file)?;
        self.read_record_at(&file, lsn)
    }

    /// LSN of the record after `lsn`, stepping into the next file when the
    /// current one ends.
    pub fn next(&self, lsn: Lsn) -> Result<Lsn> {
        let head = self.head_lsn();
        let len = self.frame_len_at(lsn)?;
        let cand = Lsn::new(lsn.file, lsn.offset + len);
        if cand >= head {
            return Err(self.not_found(cand));
        }
        if self.frame_len_at(cand).is_ok() {
            return Ok(cand);
        }
        let switched = Lsn::new(lsn.file + 1, LOG_FILE_HEADER_SIZE);
        if switched >= head {
            return Err(self.not_found(switched));
        }
        Ok(switched)
    }

    /// LSN of the record before `lsn` (which may be the head). Walks the
    /// file from its start; used by recovery-style scans, not hot paths.
    pub fn prev(&self, lsn: Lsn) -> Result<Lsn> {
        if lsn <= self.first_lsn() {
            return Err(self.not_found(lsn));
        }
        if lsn.offset <= LOG_FILE_HEADER_SIZE {
            return self.last_in_file(lsn.file - 1);
        }
        let file = self.reader_for(lsn.file)?;
        let mut off = LOG_FILE_HEADER_SIZE;
        let mut prev = None;
        while off < lsn.offset {
            prev = Some(off);
            off += self.frame_len_in(&file, Lsn::new(lsn.file, off))?;
        }
        match prev {
            Some(offset) if off == lsn.offset => Ok(Lsn::new(lsn.file, offset)),
            _ => Err(self.not_found(lsn)),
        }
    }

    /// Cursor positioned nowhere; step it with first/set/next/prev.
    pub fn cursor(&self) -> LogCursor<'_> {
        LogCursor::new(self)
    }

    pub fn head_lsn(&self) -> Lsn {
        self.tail.lock().head
    }

    /// First record we still retain (oldest file, first record slot).
    pub fn first_lsn(&self) -> Lsn {
        let tail = self.tail.lock();
        Lsn::new(tail.oldest_file, LOG_FILE_HEADER_SIZE)
    }

    pub fn checkpoint_lsn(&self) -> Option<Lsn> {
        self.tail.lock().checkpoint
    }

    pub fn recovery_info(&self) -> RecoveryInfo {
        let tail = self.tail.lock();
        RecoveryInfo {
            head: tail.head,
            checkpoint: tail.checkpoint,
        }
    }

    /// On-disk format version of one log file, for new-file announcements.
    pub fn file_version(&self, file: u32) -> Result<u32> {
        let handle = self.reader_for(file)?;
        let mut buf = [0u8; LOG_FILE_HEADER_SIZE as usize];
        handle
            .read_exact_at(&mut buf, 0)
            .map_err(|_| StorageError::Corrupt {
                file,
                reason: "short header".into(),
            })?;
        Ok(LogFileHeader::decode(file, &buf)?.version)
    }

    /// Discards everything at and after `lsn` without rewriting records:
    /// resets the head and checkpoint bookkeeping and deletes files
    /// numbered above `lsn.file`. Used when a diverged suffix of the log
    /// is being thrown away in favor of the primary's history.
    pub fn virtual_truncate(&self, lsn: Lsn, checkpoint: Option<Lsn>) -> Result<()> {
        let mut tail = self.tail.lock();
        for file in (lsn.file + 1)..=tail.head.file {
            match fs::remove_file(log_file_path(&self.dir, file)) {
                Ok(()) => debug!("removed log file {} past truncation point", file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let path = log_file_path(&self.dir, lsn.file);
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.set_len(lsn.offset as u64)?;
        info!("log truncated to {} (was {})", lsn, tail.head);
        tail.file = file;
        tail.head = lsn;
        tail.checkpoint = checkpoint;
        *self.read_cache.lock() = None;
        Ok(())
    }

    /// Forces the tail file to stable storage; the whole fsync under the
    /// `Batched` sync policy.
    pub fn flush(&self) -> Result<()> {
        let file = self.tail.lock().file.try_clone()?;
        file.sync_data()?;
        Ok(())
    }

    // -
    // Internal helpers

    fn rotate(&self, tail: &mut Tail) -> Result<()> {
        let next_file = tail.head.file + 1;
        let file = Self::create_file(&self.settings, next_file)?;
        debug!(
            "log rotated to file {} at head {}",
            next_file, tail.head
        );
        tail.file = file;
        tail.head = Lsn::new(next_file, LOG_FILE_HEADER_SIZE);
        Ok(())
    }

    fn create_file(settings: &LogSettings, number: u32) -> Result<File> {
        let path = log_file_path(&settings.dir, number);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let header = LogFileHeader::new(settings.file_mode, settings.max_file_size);
        file.write_all_at(&header.encode(), 0)?;
        file.sync_data()?;
        Ok(file)
    }

    fn list_files(dir: &PathBuf) -> Result<Vec<u32>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(number) = entry.file_name().to_str().and_then(parse_file_number) {
                files.push(number);
            }
        }
        files.sort_unstable();
        Ok(files)
    }

    /// Walks one file's records, returning the offset after the last fully
    /// decodable record (a torn tail is tolerated) and the last checkpoint
    /// marker seen.
    fn scan_file(file: &File, number: u32) -> Result<(u32, Option<Lsn>)> {
        let file_len = file.metadata()?.len();
        let mut off = LOG_FILE_HEADER_SIZE as u64;
        let mut checkpoint = None;
        loop {
            let mut frame = [0u8; RECORD_FRAME_OVERHEAD as usize];
            if off + RECORD_FRAME_OVERHEAD as u64 > file_len
                || file.read_exact_at(&mut frame, off).is_err()
            {
                break;
            }
            let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let raw_type = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
            if len < 4 || off + 4 + len as u64 > file_len {
                // Torn trailing record from an interrupted append.
                break;
            }
            if RecordType::from_u32(raw_type) == Some(RecordType::Checkpoint) {
                checkpoint = Some(Lsn::new(number, off as u32));
            }
            off += 4 + len as u64;
        }
        Ok((off as u32, checkpoint))
    }

    fn last_in_file(&self, number: u32) -> Result<Lsn> {
        let head = self.head_lsn();
        if number < self.first_lsn().file || number > head.file {
            return Err(self.not_found(Lsn::new(number, 0)));
        }
        let file = self.reader_for(number)?;
        let limit = if number == head.file {
            head.offset
        } else {
            u32::MAX
        };
        let mut off = LOG_FILE_HEADER_SIZE;
        let mut last = None;
        while off < limit {
            match self.frame_len_in(&file, Lsn::new(number, off)) {
                Ok(len) => {
                    last = Some(off);
                    off += len;
                }
                Err(_) => break,
            }
        }
        last.map(|offset| Lsn::new(number, offset))
            .ok_or_else(|| self.not_found(Lsn::new(number, LOG_FILE_HEADER_SIZE)))
    }

    fn reader_for(&self, number: u32) -> Result<File> {
        let mut cache = self.read_cache.lock();
        if let Some((cached, file)) = cache.as_ref() {
            if *cached == number {
                return Ok(file.try_clone()?);
            }
        }
        let file = File::open(log_file_path(&self.dir, number)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                self.not_found(Lsn::new(number, 0))
            } else {
                e.into()
            }
        })?;
        let handle = file.try_clone()?;
        *cache = Some((number, file));
        Ok(handle)
    }

    fn read_record_at(&self, file: &File, lsn: Lsn) -> Result<LogRecord> {
        let len = self.frame_len_in(file, lsn)?;
        let mut body = vec![0u8; (len - 4) as usize];
        file.read_exact_at(&mut body, lsn.offset as u64 + 4)
            .map_err(|_| StorageError::Corrupt {
                file: lsn.file,
                reason: format!("truncated record at {}", lsn),
            })?;
        let raw_type = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let rec_type = RecordType::from_u32(raw_type).ok_or(StorageError::Corrupt {
            file: lsn.file,
            reason: format!("unknown record type {} at {}", raw_type, lsn),
        })?;
        Ok(LogRecord::new(lsn, rec_type, body.split_off(4)))
    }

    /// Whole-frame length (prefix included) of the record at `lsn`, or
    /// `NotFound` when the offset is past the end of that file.
    fn frame_len_at(&self, lsn: Lsn) -> Result<u32> {
        let file = self.reader_for(lsn.file)?;
        self.frame_len_in(&file, lsn)
    }

    fn frame_len_in(&self, file: &File, lsn: Lsn) -> Result<u32> {
        let mut len_buf = [0u8; 4];
        file.read_exact_at(&mut len_buf, lsn.offset as u64)
            .map_err(|_| self.not_found(lsn))?;
        let len = u32::from_be_bytes(len_buf);
        if len < 4 || len as u64 + 4 > self.settings.max_file_size as u64 {
            return Err(StorageError::Corrupt {
                file: lsn.file,
                reason: format!("bad record length {} at {}", len, lsn),
            }
            .into());
        }
        Ok(4 + len)
    }

    fn not_found(&self, lsn: Lsn) -> crate::Error {
        StorageError::NotFound {
            file: lsn.file,
            offset: lsn.offset,
        }
        .into()
    }
}
