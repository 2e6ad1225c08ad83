//! The TUN dispatcher: reads IP packets off the device and routes them to
//! the connection pool.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use log::trace;
use nix::poll::{poll, PollFd, PollFlags};

use crate::conn_manager::ConnectionManager;
use crate::tcp::Packet;

// Room for an MTU-sized packet plus the packet-info prefix some devices
// prepend.
const READ_BUF_SIZE: usize = 1504;

// Short poll timeout so a shutdown request is noticed even when the
// device is idle.
const POLL_TIMEOUT_MS: i32 = 10;

pub(crate) fn packet_loop(
    nic: Arc<tun_tap::Iface>,
    manager: Arc<ConnectionManager>,
) -> io::Result<()> {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let mut pfd = [PollFd::new(nic.as_raw_fd(), PollFlags::POLLIN)];
        let n = poll(&mut pfd[..], POLL_TIMEOUT_MS).map_err(io::Error::from)?;
        if manager.is_closing() {
            return Ok(());
        }
        if n == 0 {
            continue;
        }
        let nbytes = nic.recv(&mut buf[..])?;
        match Packet::parse(buf[..nbytes].to_vec()) {
            Ok(pkt) => manager.dispatch(pkt),
            // Not IP, not TCP, or truncated; the device carries plenty of
            // traffic that is not ours.
            Err(err) => trace!("ignoring packet: {err}"),
        }
    }
}
