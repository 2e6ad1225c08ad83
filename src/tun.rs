//! The TUN egress seam.

use std::io;
use std::sync::Arc;

/// A sink for fully-formed IP packets (checksums already set).
///
/// Shared by every handler on the device; implementations serialize
/// concurrent writes. A write error is fatal to the connection that
/// attempted it.
pub trait Writer: Send + Sync {
    fn write(&self, pkt: &[u8]) -> io::Result<()>;
}

/// The production sink: a TUN device. Each packet is a single write
/// syscall on the device fd, which the kernel serializes.
pub struct TunWriter {
    iface: Arc<tun_tap::Iface>,
}

impl TunWriter {
    pub fn new(iface: Arc<tun_tap::Iface>) -> TunWriter {
        TunWriter { iface }
    }
}

impl Writer for TunWriter {
    fn write(&self, pkt: &[u8]) -> io::Result<()> {
        let n = self.iface.send(pkt)?;
        if n != pkt.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to TUN device",
            ));
        }
        Ok(())
    }
}
