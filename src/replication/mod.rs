//! Log-shipping replication.
//!
//! The engine answers "give me everything after X" and "give me record X"
//! by streaming log records (bulk-batched or throttled), and on the
//! consuming side applies records in LSN order, detecting gaps and
//! requesting what is missing. Durability of a record is a function of
//! which sites have acknowledged it.

mod bulk;
mod durability;
mod election;
mod engine;
mod gap;
mod throttle;

pub(crate) use bulk::*;
pub use durability::*;
pub use election::*;
pub use engine::*;
pub use gap::*;
pub(crate) use throttle::*;

#[cfg(test)]
mod bulk_test;
#[cfg(test)]
mod durability_test;
#[cfg(test)]
mod engine_test;

// -----------------------------------------------------------------------------
// Sending seam between the engine and the transport

use crate::Ack;
use crate::RepMessage;
use crate::Result;

#[cfg(test)]
use mockall::automock;

/// Where an outbound replication message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Exactly this site
    Site(u32),
    /// Best effort to every connected site
    Broadcast,
    /// Whoever can serve it: a peer to spare the primary, unless this is a
    /// re-request after such an attempt already failed
    Anywhere { rerequest: bool },
}

/// How many sites a send reached (or was queued for): the ceiling on the
/// acknowledgements that could possibly come back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub sites: u32,
    pub peers: u32,
}

/// Message-sending seam implemented by the transport. The engine never
/// touches sockets directly.
#[cfg_attr(test, automock)]
pub trait RepSender: Send + Sync {
    fn send(&self, dest: Destination, msg: &RepMessage) -> Result<SendOutcome>;

    fn send_ack(&self, eid: u32, ack: Ack) -> Result<()>;
}
