use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::SendFrame;
use crate::metrics::MSGS_DROPPED;
use crate::metrics::MSGS_QUEUED;
use crate::NetworkError;
use crate::Result;

struct QueuedOutput {
    msg: Arc<Vec<u8>>,
    offset: usize,
}

/// One stream to one remote site.
///
/// Output follows a single-writer discipline: a worker may write in-line
/// only while the outbound queue is empty; the moment a write would block,
/// the rest of the message is queued and the transport task owns all
/// further writes until the queue drains. Whose turn it is follows from
/// queue emptiness alone, checked under the queue lock, which also keeps
/// two workers from interleaving the bytes of two messages.
pub struct Connection {
    id: u64,
    stream: TcpStream,
    /// Owning site; -1 until a handshake binds it
    eid: AtomicI64,
    defunct: AtomicBool,
    outbound: Mutex<VecDeque<QueuedOutput>>,
    write_wake: Notify,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn new(id: u64, stream: TcpStream, eid: Option<u32>) -> Self {
        Self {
            id,
            stream,
            eid: AtomicI64::new(eid.map(i64::from).unwrap_or(-1)),
            defunct: AtomicBool::new(false),
            outbound: Mutex::new(VecDeque::new()),
            write_wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn eid(&self) -> Option<u32> {
        let raw = self.eid.load(Ordering::Acquire);
        (raw >= 0).then(|| raw as u32)
    }

    pub(crate) fn bind_eid(&self, eid: u32) {
        self.eid.store(i64::from(eid), Ordering::Release);
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    /// Flags the connection dead and wakes its I/O task for teardown. All
    /// queued output is freed with the connection; anyone blocked on it is
    /// unblocked through the site-level retry machinery.
    pub fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    pub(crate) fn write_wake(&self) -> &Notify {
        &self.write_wake
    }

    /// Sends a frame, in-line when this caller owns the socket (empty
    /// queue), queued otherwise. With `drop_when_full` set, a queue past
    /// that depth silently drops the message instead: best-effort sends
    /// must not let one slow consumer back-pressure the broadcaster.
    pub fn send_frame(&self, frame: &SendFrame, drop_when_full: Option<usize>) -> Result<()> {
        if self.is_defunct() {
            return Err(self.unavailable());
        }
        let mut queue = self.outbound.lock();
        if !queue.is_empty() {
            // Output is owned by the transport task; we can only queue.
            if let Some(limit) = drop_when_full {
                if queue.len() >= limit {
                    trace!("queue limit exceeded; dropping message");
                    MSGS_DROPPED.inc();
                    return Ok(());
                }
            }
            queue.push_back(QueuedOutput {
                msg: frame.flattened(),
                offset: 0,
            });
            MSGS_QUEUED.inc();
            return Ok(());
        }

        // In-line fast path: scatter-write as much as the socket takes
        // without blocking.
        let total = frame.len();
        let mut written = 0usize;
        while written < total {
            let slices = frame.slices_from(written);
            match self.stream.try_write_vectored(&slices) {
                Ok(0) => return Err(self.unavailable()),
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    trace!("wrote only {} of {} bytes; queueing the rest", written, total);
                    queue.push_back(QueuedOutput {
                        msg: frame.flattened(),
                        offset: written,
                    });
                    MSGS_QUEUED.inc();
                    // The transport task now owns this connection's output.
                    self.write_wake.notify_one();
                    return Ok(());
                }
                Err(e) => {
                    debug!("socket writing failure: {}", e);
                    return Err(self.unavailable());
                }
            }
        }
        Ok(())
    }

    /// Transport-side write driver: pushes queued bytes while the socket
    /// accepts them. Ok(true) once the queue is empty and in-line sending
    /// may resume.
    pub(crate) fn drive_writes(&self) -> Result<bool> {
        loop {
            let (msg, offset) = {
                let queue = self.outbound.lock();
                match queue.front() {
                    None => return Ok(true),
                    Some(front) => (front.msg.clone(), front.offset),
                }
            };
            match self.stream.try_write(&msg[offset..]) {
                Ok(0) => return Err(self.unavailable()),
                Ok(n) => {
                    let mut queue = self.outbound.lock();
                    if let Some(front) = queue.front_mut() {
                        front.offset += n;
                        if front.offset >= front.msg.len() {
                            queue.pop_front();
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => {
                    debug!("writing data: {}", e);
                    return Err(self.unavailable());
                }
            }
        }
    }

    fn unavailable(&self) -> crate::Error {
        NetworkError::Unavailable {
            eid: self.eid().unwrap_or(0),
        }
        .into()
    }
}
