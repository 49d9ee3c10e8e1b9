//! Site-to-site transport: wire framing, per-connection queues under a
//! single-writer discipline, the site table with retry scheduling, and the
//! listener/connector loops.

mod codec;
mod connection;
mod message;
mod site_table;
mod transport;

pub use codec::*;
pub use connection::*;
pub use message::*;
pub use site_table::*;
pub use transport::*;

#[cfg(test)]
mod codec_test;
#[cfg(test)]
mod message_test;
