//! Owner of the TUN device and the dispatcher thread.

use std::io;
use std::sync::Arc;
use std::thread;

use log::error;

use crate::conn_manager::{ConnectionManager, StreamConnector};
use crate::packet_loop::packet_loop;
use crate::tun::TunWriter;

pub struct Interface {
    manager: Arc<ConnectionManager>,
    join_handle: Option<thread::JoinHandle<io::Result<()>>>,
}

impl Interface {
    /// Open `name` as a TUN device and start terminating TCP flows on it,
    /// bridging each to a stream obtained from `connector`.
    pub fn new(name: &str, connector: StreamConnector) -> io::Result<Interface> {
        let nic = Arc::new(tun_tap::Iface::without_packet_info(
            name,
            tun_tap::Mode::Tun,
        )?);
        let to_tun = Arc::new(TunWriter::new(Arc::clone(&nic)));
        let manager = ConnectionManager::new(connector, to_tun);

        let join_handle = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || packet_loop(nic, manager))
        };

        Ok(Interface {
            manager,
            join_handle: Some(join_handle),
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.manager.begin_shutdown();
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("packet loop: {err}"),
                Err(_) => error!("packet loop panicked"),
            }
        }
        self.manager.finish_shutdown();
    }
}
