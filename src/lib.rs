//! Replicated write-ahead log for an embedded transactional storage
//! engine.
//!
//! Three layers, leaves first: a durable, file-segmented [`LogStore`]
//! addressing records by [`Lsn`]; a log-shipping [`ReplicationEngine`]
//! that keeps replica sites synchronized with a primary's log, detecting
//! and re-requesting gaps; and a framed TCP [`Transport`] whose
//! per-connection outbound queues follow a single-writer discipline.
//! Durability of a committed record is computed from site
//! acknowledgements against a configurable [`AckPolicy`].
//!
//! The election algorithm itself is external: this crate only reads a
//! shared [`ElectionView`] (who is primary, current generation) and
//! surfaces the transport events elections react to.

mod config;
mod constants;
mod errors;
mod metrics;
mod network;
mod replication;
mod storage;

pub use config::*;
pub use errors::*;
pub use metrics::*;
pub use network::*;
pub use replication::*;
pub use storage::*;
