//! The manager stream: the message-framed transport that carries payload
//! between a connection handler and the far side of the tunnel.

use std::io;
use std::sync::Arc;

/// One framed message on the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Connection payload, in TCP sequence order.
    Data(Vec<u8>),
    /// Liveness signal; carries nothing and may be dropped under load.
    KeepAlive,
}

/// A bidirectional, message-framed transport with ordered delivery.
///
/// Implementations must unblock a pending `read_message` when `close` is
/// called, so handler teardown never waits on the far side.
pub trait Stream: Send + Sync {
    /// Next message from the far side; `Ok(None)` is end of stream.
    fn read_message(&self) -> io::Result<Option<Message>>;

    /// Push one message toward the far side.
    fn write_message(&self, msg: Message) -> io::Result<()>;

    /// Tear the stream down. Idempotent.
    fn close(&self) -> io::Result<()>;
}

/// Opens the manager stream for one connection. Called once, when the
/// handshake reaches SYN-RECEIVED.
pub type StreamCreator = Box<dyn Fn() -> io::Result<Arc<dyn Stream>> + Send + Sync>;
