use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;

use crate::metrics::GAP_REQUESTS;
use crate::LogStore;
use crate::Lsn;
use crate::RecordType;
use crate::Result;

/// One record (or file switch) held back because it arrived ahead of the
/// contiguous prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BufferedEntry {
    Record {
        rec_type: RecordType,
        flags: u32,
        payload: Vec<u8>,
    },
    FileSwitch,
}

/// Overrides for the "is a request already outstanding" check, used when
/// the target site may have changed (a new primary was elected) or a prior
/// request is known to have failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapFlags {
    pub force: bool,
    pub rerequest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapRequestKind {
    /// Everything from `from` on: the upper bound is unknown
    All { from: Lsn },
    /// The range `from..end`
    Range { from: Lsn, end: Lsn },
}

/// A missing-record request the engine should put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRequest {
    pub kind: GapRequestKind,
    pub rerequest: bool,
}

/// A record that made it into the contiguous prefix during an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRecord {
    pub lsn: Lsn,
    pub rec_type: RecordType,
    pub flags: u32,
}

/// What one offered record produced.
#[derive(Debug, Default)]
pub struct OfferOutcome {
    /// Records appended to the store, in order (the offered one plus any
    /// buffered successors that became contiguous)
    pub applied: Vec<AppliedRecord>,
    /// Missing-record request to issue, if a hole was (still) open
    pub request: Option<GapRequest>,
    /// The record was already present; an idempotent no-op
    pub duplicate: bool,
}

struct GapInner {
    /// Contiguous-prefix boundary: the next LSN we can apply
    ready: Lsn,
    /// Lowest out-of-order LSN held in the buffer; ZERO when none
    waiting: Lsn,
    /// End of the outstanding request; ZERO when no request is out
    max_wait: Lsn,
    buffer: BTreeMap<Lsn, BufferedEntry>,
}

/// Per-consumer gap bookkeeping: which prefix of the log is applied, what
/// is known to be missing, and whether a request for it is already
/// outstanding. Holds its own lock, acquired before any site-level lock.
pub struct GapTracker {
    inner: Mutex<GapInner>,
    lookahead: u32,
}

impl GapTracker {
    pub fn new(head: Lsn, lookahead: u32) -> Self {
        Self {
            inner: Mutex::new(GapInner {
                ready: head,
                waiting: Lsn::ZERO,
                max_wait: Lsn::ZERO,
                buffer: BTreeMap::new(),
            }),
            lookahead,
        }
    }

    /// Offers one inbound record (or file switch) at `lsn`. In-sequence
    /// entries are applied to the store, followed by any buffered
    /// successors that became contiguous; out-of-order entries are held
    /// back and may produce a request for the hole in front of them.
    /// Duplicates are idempotent no-ops.
    pub(crate) fn offer(
        &self,
        store: &LogStore,
        lsn: Lsn,
        entry: BufferedEntry,
    ) -> Result<OfferOutcome> {
        let mut g = self.inner.lock();
        let mut out = OfferOutcome::default();
        g.ready = store.head_lsn();

        if lsn < g.ready {
            trace!("duplicate record {} below prefix {}", lsn, g.ready);
            out.duplicate = true;
            return Ok(out);
        }

        if lsn > g.ready {
            if g.buffer.contains_key(&lsn) {
                trace!("duplicate of buffered record {}", lsn);
                out.duplicate = true;
                return Ok(out);
            }
            debug!("hole at {}: received {} out of order", g.ready, lsn);
            g.buffer.insert(lsn, entry);
            if g.waiting.is_zero() || lsn < g.waiting {
                g.waiting = lsn;
            }
            out.request = self.decide(&mut g, Some(lsn), GapFlags::default());
            return Ok(out);
        }

        Self::apply(store, lsn, entry, &mut out)?;
        g.ready = store.head_lsn();
        loop {
            // Buffered duplicates the prefix has since passed are dropped.
            while let Some((&key, _)) = g.buffer.first_key_value() {
                if key < g.ready {
                    g.buffer.remove(&key);
                } else {
                    break;
                }
            }
            match g.buffer.first_key_value() {
                Some((&key, _)) if key == g.ready => {
                    let entry = g.buffer.remove(&key).expect("buffered entry vanished");
                    Self::apply(store, key, entry, &mut out)?;
                    g.ready = store.head_lsn();
                }
                _ => break,
            }
        }
        g.waiting = g
            .buffer
            .first_key_value()
            .map(|(&key, _)| key)
            .unwrap_or(Lsn::ZERO);
        if !g.max_wait.is_zero() && g.ready >= g.max_wait {
            g.max_wait = Lsn::ZERO;
        }
        Ok(out)
    }

    /// Forced re-request of whatever is outstanding, for callers that know
    /// the target site may have changed (an election just completed).
    pub fn force_request(&self, flags: GapFlags) -> Option<GapRequest> {
        let mut g = self.inner.lock();
        self.decide(&mut g, None, flags)
    }

    /// Follow-up request after a log-more marker: the sender paused, so
    /// the transfer only continues if we ask again. Resumes from the later
    /// of our prefix and the announced position (the marker may have
    /// arrived out of order). With no hole open, the outstanding window is
    /// raised by the look-ahead so the announced burst of records does not
    /// fire a request apiece.
    pub fn log_more_request(&self, announced: Lsn) -> GapRequest {
        let mut g = self.inner.lock();
        let resume = g.ready.max(announced);
        let kind = if g.waiting.is_zero() {
            g.max_wait = Lsn::new(resume.file, resume.offset.saturating_add(self.lookahead));
            GapRequestKind::All { from: resume }
        } else {
            g.max_wait = g.waiting;
            if g.max_wait <= resume {
                g.max_wait = Lsn::ZERO;
                GapRequestKind::All { from: resume }
            } else {
                GapRequestKind::Range {
                    from: resume,
                    end: g.max_wait,
                }
            }
        };
        GAP_REQUESTS.inc();
        GapRequest {
            kind,
            rerequest: false,
        }
    }

    /// The contiguous-prefix boundary.
    pub fn ready_lsn(&self) -> Lsn {
        self.inner.lock().ready
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (Lsn, Lsn, Lsn) {
        let g = self.inner.lock();
        (g.ready, g.waiting, g.max_wait)
    }

    /// Decides whether to put a request on the wire. We ask when forced,
    /// when nothing is outstanding, or when the single record we were
    /// waiting on arrived (and the hole in front of it still exists).
    fn decide(&self, g: &mut GapInner, incoming: Option<Lsn>, flags: GapFlags) -> Option<GapRequest> {
        let overridden = flags.force || flags.rerequest;
        let awaited_arrived =
            incoming.map_or(false, |lsn| !g.max_wait.is_zero() && lsn == g.max_wait);
        if !overridden && !g.max_wait.is_zero() && !awaited_arrived {
            return None;
        }
        g.max_wait = g.waiting;
        if flags.force {
            // A forced request may need to aim beyond anything we have
            // buffered; without a future bound it degrades to "send all".
            if let Some(lsn) = incoming {
                if g.max_wait <= lsn {
                    g.max_wait = Lsn::ZERO;
                }
            }
        }
        let from = g.ready;
        let kind = if g.max_wait.is_zero() {
            GapRequestKind::All { from }
        } else {
            GapRequestKind::Range {
                from,
                end: g.max_wait,
            }
        };
        GAP_REQUESTS.inc();
        debug!("requesting gap {:?} (rerequest: {})", kind, flags.rerequest);
        Some(GapRequest {
            kind,
            rerequest: flags.rerequest,
        })
    }

    fn apply(
        store: &LogStore,
        lsn: Lsn,
        entry: BufferedEntry,
        out: &mut OfferOutcome,
    ) -> Result<()> {
        match entry {
            BufferedEntry::Record {
                rec_type,
                flags,
                payload,
            } => {
                store.apply_record(lsn, rec_type, &payload)?;
                out.applied.push(AppliedRecord {
                    lsn,
                    rec_type,
                    flags,
                });
            }
            BufferedEntry::FileSwitch => {
                store.force_rotate()?;
            }
        }
        Ok(())
    }
}
