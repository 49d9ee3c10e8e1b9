use std::sync::Arc;

use tracing::debug;
use tracing::error;
use tracing::warn;

use super::split_bulk;
use super::BufferedEntry;
use super::BulkBuffer;
use super::Destination;
use super::ElectionView;
use super::GapFlags;
use super::GapRequest;
use super::GapRequestKind;
use super::GapTracker;
use super::RepSender;
use super::SendOutcome;
use super::Throttle;
use crate::config::ReplicationSettings;
use crate::constants::LOG_VERSION;
use crate::metrics::BULK_FILLS;
use crate::metrics::BULK_OVERFLOWS;
use crate::network::decode_record_body;
use crate::network::encode_record_body;
use crate::network::rep_flags;
use crate::Ack;
use crate::Error;
use crate::LogRecord;
use crate::LogStore;
use crate::Lsn;
use crate::NetworkError;
use crate::RecordType;
use crate::RepMessage;
use crate::ReplicationError;
use crate::Result;
use crate::StorageError;

/// Log-shipping engine: serves record requests from our own log and
/// applies records shipped by other sites, tracking gaps on the way.
///
/// The engine is invoked once per inbound protocol message; streaming
/// responses stop early on backpressure and the requester picks the
/// transfer back up with a fresh request.
pub struct ReplicationEngine<S: RepSender> {
    log: Arc<LogStore>,
    gap: GapTracker,
    election: Arc<dyn ElectionView>,
    sender: S,
    settings: ReplicationSettings,
}

/// Outcome of repositioning a request that pointed past the end of a file.
enum Positioned {
    /// Continue from here (a new-file marker has been sent)
    At(Lsn),
    /// The requester is beyond saving; it has been told to resync
    VerifyFailSent,
    /// The LSN names nothing we know about
    Unknown,
}

struct StreamState {
    bulk: Option<BulkBuffer>,
    throttle: Throttle,
    prev_file: u32,
    prev_end: Lsn,
    log_end: Option<Lsn>,
}

impl<S: RepSender> ReplicationEngine<S> {
    pub fn new(
        log: Arc<LogStore>,
        election: Arc<dyn ElectionView>,
        sender: S,
        settings: ReplicationSettings,
    ) -> Self {
        let gap = GapTracker::new(log.head_lsn(), settings.gap_lookahead_bytes);
        Self {
            log,
            gap,
            election,
            sender,
            settings,
        }
    }

    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    pub(crate) fn gap(&self) -> &GapTracker {
        &self.gap
    }

    /// Primary-side commit path: appends locally and pushes the record to
    /// every connected site. Returns the LSN and how many sites the push
    /// reached, the input to the caller's durability wait.
    pub fn append(&self, rec_type: RecordType, payload: &[u8]) -> Result<(Lsn, SendOutcome)> {
        let lsn = self.log.append(rec_type, payload)?;
        let mut flags = 0;
        if rec_type.needs_ack() {
            flags |= rep_flags::NEEDS_ACK;
        }
        let msg = RepMessage::Log {
            lsn,
            rec_type,
            flags,
            payload: payload.to_vec(),
        };
        let outcome = match self.sender.send(Destination::Broadcast, &msg) {
            Ok(outcome) => outcome,
            Err(e) if is_unavailable(&e) => SendOutcome::default(),
            Err(e) => return Err(e),
        };
        Ok((lsn, outcome))
    }

    /// Dispatches one inbound replication message.
    pub fn process_message(&self, from_eid: u32, msg: RepMessage) -> Result<()> {
        match msg {
            RepMessage::AllReq { from } => self.serve_all_request(from_eid, from),
            RepMessage::LogReq { from, end } => self.serve_log_request(from_eid, from, end),
            RepMessage::Log {
                lsn,
                rec_type,
                flags,
                payload,
            } => self.consume_log(from_eid, lsn, rec_type, flags, payload, false),
            RepMessage::LogMore {
                lsn,
                rec_type,
                flags,
                payload,
            } => self.consume_log(from_eid, lsn, rec_type, flags, payload, true),
            RepMessage::BulkLog {
                first_lsn: _,
                flags,
                payload,
            } => self.consume_bulk(from_eid, flags, &payload),
            RepMessage::NewFile {
                end_of_file,
                log_version,
            } => self.consume_new_file(from_eid, end_of_file, log_version),
            RepMessage::VerifyFail { lsn } => {
                error!(
                    "site {} cannot serve our log from {}; full resync required",
                    from_eid, lsn
                );
                Err(ReplicationError::OutdatedClient {
                    file: lsn.file,
                    offset: lsn.offset,
                }
                .into())
            }
            RepMessage::PrimaryQuery => {
                debug!("primary query from {} left to the election layer", from_eid);
                Ok(())
            }
        }
    }

    /// Forced re-request of outstanding gaps, for callers that know the
    /// target site may have changed (an election just completed).
    pub fn request_gap(&self, flags: GapFlags) -> Result<()> {
        match self.gap.force_request(flags) {
            Some(request) => self.issue_gap_request(request),
            None => Ok(()),
        }
    }

    // -
    // Serving side

    /// Answers "send everything from `from` on".
    pub fn serve_all_request(&self, eid: u32, from: Lsn) -> Result<()> {
        debug!("all-request from site {} starting at {}", eid, from);
        let mut cursor = self.log.cursor();
        let log_end = match cursor.last() {
            Ok(rec) => rec.lsn(),
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut rec = if from.is_unset() {
            let rec = cursor.first()?;
            if rec.lsn().file != 1 {
                // The requester has nothing and our oldest retained file is
                // not the first: the records before it are gone for good.
                warn!(
                    "site {} is outdated; oldest retained record is {}",
                    eid,
                    rec.lsn()
                );
                self.try_send(eid, &RepMessage::VerifyFail { lsn: rec.lsn() })?;
                return Ok(());
            }
            rec
        } else {
            match cursor.set(from) {
                Ok(rec) => rec,
                Err(e) if is_not_found(&e) => match self.check_new_file(eid, from)? {
                    Positioned::At(lsn) => match cursor.set(lsn) {
                        Ok(rec) => rec,
                        Err(e2) if is_not_found(&e2) && self.is_primary() => return Ok(()),
                        Err(e2) => return Err(e2),
                    },
                    Positioned::VerifyFailSent => return Ok(()),
                    Positioned::Unknown => {
                        // A bad or unknown LSN; the primary shrugs it off.
                        return if self.is_primary() { Ok(()) } else { Err(e) };
                    }
                },
                Err(e) => return Err(e),
            }
        };

        let mut state = self.begin_stream(&rec, Some(log_end));
        loop {
            if !self.stream_record(eid, &mut state, &rec)? {
                break;
            }
            match cursor.next() {
                Ok(next) => rec = next,
                // End of log: not an error, there is simply no more data.
                Err(e) if is_not_found(&e) => break,
                Err(e) => return Err(e),
            }
        }
        self.finish_stream(eid, &mut state)
    }

    /// Answers "send record `from`" and, when `end` is given, the whole
    /// gap up to (excluding) it.
    pub fn serve_log_request(&self, eid: u32, from: Lsn, end: Option<Lsn>) -> Result<()> {
        debug!(
            "log-request from site {} for {} (range end {:?})",
            eid, from, end
        );
        let mut cursor = self.log.cursor();
        let first = match cursor.set(from) {
            Ok(rec) => {
                self.try_send(eid, &log_singleton(&rec))?;
                rec
            }
            Err(e) if is_not_found(&e) => match self.check_new_file(eid, from)? {
                Positioned::At(lsn) => match cursor.set(lsn) {
                    Ok(rec) => {
                        self.try_send(eid, &log_singleton(&rec))?;
                        rec
                    }
                    Err(e2) if is_not_found(&e2) && self.is_primary() => return Ok(()),
                    Err(e2) => return Err(e2),
                },
                Positioned::VerifyFailSent => return Ok(()),
                Positioned::Unknown => {
                    return if self.is_primary() {
                        // The primary failing to serve its own log is not
                        // survivable by pretending otherwise.
                        error!("request for {} fails", from);
                        Err(ReplicationError::PrimaryLogBroken {
                            file: from.file,
                            offset: from.offset,
                        }
                        .into())
                    } else {
                        Err(e)
                    };
                }
            },
            Err(e) => return Err(e),
        };

        let Some(end) = end else { return Ok(()) };

        let mut state = self.begin_stream(&first, None);
        state.prev_end = Lsn::new(first.lsn().file, first.lsn().offset + first.frame_len());
        loop {
            match cursor.next() {
                Ok(next) => {
                    if next.lsn() >= end {
                        break;
                    }
                    if !self.stream_record(eid, &mut state, &next)? {
                        break;
                    }
                }
                Err(e) if is_not_found(&e) => {
                    // We only hold part of the requested gap. The primary
                    // treats that as the natural end of its log; a relay
                    // must propagate the miss so the requester issues a
                    // fresh request elsewhere instead of assuming the
                    // range was complete.
                    if self.is_primary() {
                        break;
                    }
                    self.finish_stream(eid, &mut state)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        self.finish_stream(eid, &mut state)
    }

    /// The requested LSN is past the end of a file we still have: announce
    /// the file boundary and resume in the next file. Requests before our
    /// oldest retained file mean the requester must resync (if we are the
    /// primary and the answer is authoritative) or ask someone else.
    fn check_new_file(&self, eid: u32, req: Lsn) -> Result<Positioned> {
        let head = self.log.head_lsn();
        if head.file <= req.file {
            return Ok(Positioned::Unknown);
        }
        match self.log.end_of_file(req.file) {
            Ok(end) => {
                let version = self.log.file_version(req.file)?;
                self.try_send(
                    eid,
                    &RepMessage::NewFile {
                        end_of_file: end,
                        log_version: version,
                    },
                )?;
                Ok(Positioned::At(Lsn::new(
                    req.file + 1,
                    crate::constants::LOG_FILE_HEADER_SIZE,
                )))
            }
            Err(e) if is_not_found(&e) => {
                if self.is_primary() {
                    warn!("site {} asked for {} which we no longer retain", eid, req);
                    self.try_send(eid, &RepMessage::VerifyFail { lsn: req })?;
                    Ok(Positioned::VerifyFailSent)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn begin_stream(&self, first: &LogRecord, log_end: Option<Lsn>) -> StreamState {
        let bulk = if self.settings.bulk_enabled() {
            Some(BulkBuffer::new(
                self.settings.bulk_buffer_size,
                self.settings.bulk_max_records,
            ))
        } else {
            None
        };
        StreamState {
            bulk,
            throttle: Throttle::new(self.settings.throttle_bytes),
            prev_file: first.lsn().file,
            prev_end: first.lsn(),
            log_end,
        }
    }

    /// Sends one streamed record, preferring the bulk buffer when it is
    /// enabled and the record fits. Ok(false) stops the stream: either the
    /// throttle budget ran out (the record rode a log-more marker) or the
    /// connection pushed back.
    fn stream_record(&self, eid: u32, state: &mut StreamState, rec: &LogRecord) -> Result<bool> {
        if rec.lsn().file != state.prev_file {
            // The receiver must learn of the file switch before any record
            // of the new file.
            self.flush_bulk(eid, state)?;
            let version = self.log.file_version(state.prev_file)?;
            self.try_send(
                eid,
                &RepMessage::NewFile {
                    end_of_file: state.prev_end,
                    log_version: version,
                },
            )?;
            state.prev_file = rec.lsn().file;
        }

        let at_end = state.log_end.map_or(false, |end| rec.lsn() >= end);
        let mut flags = rep_flags::RESEND;
        if rec.rec_type().needs_ack() {
            flags |= rep_flags::NEEDS_ACK;
        }
        if at_end {
            flags |= rep_flags::LOG_END;
        }
        let body = encode_record_body(rec.rec_type(), rec.payload());

        let mut keep_going = true;
        if state.throttle.consume(body.len() as u64) {
            // Budget exhausted: this record rides the log-more marker.
            self.flush_bulk(eid, state)?;
            self.try_send(
                eid,
                &RepMessage::LogMore {
                    lsn: rec.lsn(),
                    rec_type: rec.rec_type(),
                    flags,
                    payload: rec.payload().to_vec(),
                },
            )?;
            keep_going = false;
        } else if state.bulk.is_some() {
            let (oversize, fits) = {
                let bulk = state.bulk.as_ref().expect("bulk buffer vanished");
                (bulk.oversize(body.len()), bulk.fits(body.len()))
            };
            if oversize {
                BULK_OVERFLOWS.inc();
                keep_going = self.flush_bulk(eid, state)?
                    && self.try_send(eid, &log_singleton(rec))?;
            } else {
                if !fits {
                    BULK_FILLS.inc();
                    keep_going = self.flush_bulk(eid, state)?;
                }
                if keep_going {
                    let bulk = state.bulk.as_mut().expect("bulk buffer vanished");
                    bulk.push(rec.lsn(), &body, flags);
                    if flags & rep_flags::NEEDS_ACK != 0 || at_end {
                        keep_going = self.flush_bulk(eid, state)?;
                    }
                }
            }
        } else {
            keep_going = self.try_send(eid, &log_singleton(rec))?;
        }

        state.prev_end = Lsn::new(rec.lsn().file, rec.lsn().offset + rec.frame_len());
        Ok(keep_going)
    }

    fn finish_stream(&self, eid: u32, state: &mut StreamState) -> Result<()> {
        self.flush_bulk(eid, state)?;
        Ok(())
    }

    fn flush_bulk(&self, eid: u32, state: &mut StreamState) -> Result<bool> {
        let Some(bulk) = state.bulk.as_mut() else {
            return Ok(true);
        };
        match bulk.take() {
            Some(msg) => self.try_send(eid, &msg),
            None => Ok(true),
        }
    }

    /// Ok(false) on backpressure; the stream stops and the requester will
    /// come back for the rest.
    fn try_send(&self, eid: u32, msg: &RepMessage) -> Result<bool> {
        match self.sender.send(Destination::Site(eid), msg) {
            Ok(_) => Ok(true),
            Err(e) if is_unavailable(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // -
    // Consuming side

    fn consume_log(
        &self,
        eid: u32,
        lsn: Lsn,
        rec_type: RecordType,
        flags: u32,
        payload: Vec<u8>,
        more: bool,
    ) -> Result<()> {
        let outcome = self.gap.offer(
            &self.log,
            lsn,
            BufferedEntry::Record {
                rec_type,
                flags,
                payload,
            },
        )?;
        self.acknowledge(eid, &outcome.applied);
        if let Some(request) = outcome.request {
            self.issue_gap_request(request)?;
        }
        if more && !outcome.duplicate {
            // A duplicate log-more may be ancient; chasing it would open a
            // second data stream for records long applied.
            self.chase_log_more(lsn)?;
        }
        Ok(())
    }

    fn consume_bulk(&self, eid: u32, flags: u32, payload: &[u8]) -> Result<()> {
        let mut applied = Vec::new();
        let mut request = None;
        for (lsn, body) in split_bulk(payload)? {
            let (rec_type, rec_payload) = decode_record_body(body)?;
            let outcome = self.gap.offer(
                &self.log,
                lsn,
                BufferedEntry::Record {
                    rec_type,
                    flags,
                    payload: rec_payload,
                },
            )?;
            applied.extend(outcome.applied);
            if request.is_none() {
                request = outcome.request;
            }
        }
        self.acknowledge(eid, &applied);
        if let Some(request) = request {
            self.issue_gap_request(request)?;
        }
        Ok(())
    }

    fn consume_new_file(&self, eid: u32, end_of_file: Lsn, log_version: u32) -> Result<()> {
        if log_version > LOG_VERSION {
            return Err(StorageError::VersionMismatch {
                file: end_of_file.file,
                version: log_version,
            }
            .into());
        }
        let outcome = self
            .gap
            .offer(&self.log, end_of_file, BufferedEntry::FileSwitch)?;
        self.acknowledge(eid, &outcome.applied);
        if let Some(request) = outcome.request {
            self.issue_gap_request(request)?;
        }
        Ok(())
    }

    /// Acknowledges the highest needs-ack record that just became part of
    /// the contiguous prefix, once it is on stable storage.
    fn acknowledge(&self, eid: u32, applied: &[super::AppliedRecord]) {
        let ack_lsn = applied
            .iter()
            .filter(|r| r.flags & rep_flags::NEEDS_ACK != 0 || r.rec_type.needs_ack())
            .map(|r| r.lsn)
            .max();
        let Some(lsn) = ack_lsn else { return };
        if let Err(e) = self.log.flush() {
            error!("cannot flush log before acknowledging {}: {}", lsn, e);
            return;
        }
        let ack = Ack {
            lsn,
            generation: self.election.generation(),
        };
        if let Err(e) = self.sender.send_ack(eid, ack) {
            debug!("ack to site {} not delivered: {}", eid, e);
        }
    }

    fn chase_log_more(&self, announced: Lsn) -> Result<()> {
        if self.election.primary().is_none() {
            // Mid-election there is nobody to ask. Find the primary first;
            // the follow-up request rides the next record that arrives.
            let _ = self.sender.send(Destination::Broadcast, &RepMessage::PrimaryQuery);
            return Ok(());
        }
        let request = self.gap.log_more_request(announced);
        self.issue_gap_request(request)
    }

    fn issue_gap_request(&self, request: GapRequest) -> Result<()> {
        if self.election.primary().is_none() {
            let _ = self.sender.send(Destination::Broadcast, &RepMessage::PrimaryQuery);
            return Ok(());
        }
        let msg = match request.kind {
            GapRequestKind::All { from } => RepMessage::AllReq { from },
            GapRequestKind::Range { from, end } => RepMessage::LogReq {
                from,
                end: Some(end),
            },
        };
        match self.sender.send(
            Destination::Anywhere {
                rerequest: request.rerequest,
            },
            &msg,
        ) {
            Ok(_) => Ok(()),
            // Nobody reachable right now; the request is retried when the
            // next record exposes the gap again.
            Err(e) if is_unavailable(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn is_primary(&self) -> bool {
        self.election.primary() == Some(self.election.self_eid())
    }
}

fn log_singleton(rec: &LogRecord) -> RepMessage {
    let mut flags = rep_flags::RESEND;
    if rec.rec_type().needs_ack() {
        flags |= rep_flags::NEEDS_ACK;
    }
    RepMessage::Log {
        lsn: rec.lsn(),
        rec_type: rec.rec_type(),
        flags,
        payload: rec.payload().to_vec(),
    }
}

fn is_not_found(e: &Error) -> bool {
    matches!(e, Error::Storage(StorageError::NotFound { .. }))
}

fn is_unavailable(e: &Error) -> bool {
    matches!(
        e,
        Error::Network(NetworkError::Unavailable { .. })
            | Error::Network(NetworkError::NoSiteAvailable { .. })
    )
}
