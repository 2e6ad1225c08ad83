//! User-space TCP termination for TUN traffic.
//!
//! Every TCP flow that appears on the TUN device is answered locally: a
//! per-connection [`tcp::Handler`] completes the handshake, keeps the
//! sequence/retransmission/SACK machinery honest, and bridges payload to a
//! bidirectional message stream supplied by the caller (the "manager
//! stream"). [`Interface`] ties it together: device, dispatcher thread and
//! connection pool.

mod cancel;
mod conn_manager;
mod interface;
mod packet_loop;
mod quad;
pub mod tcp;
pub mod tun;
pub mod tunnel;

pub use conn_manager::{ConnectionManager, StreamConnector};
pub use interface::Interface;
pub use quad::Quad;
