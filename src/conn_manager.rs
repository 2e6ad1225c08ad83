//! The connection pool: one handler per 5-tuple, created on demand and
//! removed when it closes.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::quad::Quad;
use crate::tcp::{Handler, Packet};
use crate::tun::Writer;
use crate::tunnel::{Stream, StreamCreator};

/// Opens the manager stream for a freshly accepted connection.
pub type StreamConnector = Arc<dyn Fn(&Quad) -> io::Result<Arc<dyn Stream>> + Send + Sync>;

pub struct ConnectionManager {
    weak_self: Weak<ConnectionManager>,
    connections: Mutex<HashMap<Quad, Arc<Handler>>>,
    /// 0 running, 1 closing, 2 closed. Shared with every handler so new
    /// work can be refused early during shutdown.
    closing: Arc<AtomicI32>,
    connector: StreamConnector,
    to_tun: Arc<dyn Writer>,
}

impl ConnectionManager {
    pub fn new(connector: StreamConnector, to_tun: Arc<dyn Writer>) -> Arc<ConnectionManager> {
        Arc::new_cyclic(|weak_self| ConnectionManager {
            weak_self: weak_self.clone(),
            connections: Mutex::new(HashMap::new()),
            closing: Arc::new(AtomicI32::new(0)),
            connector,
            to_tun,
        })
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst) != 0
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Route one inbound TCP packet to its handler, creating the slot on
    /// demand. A reset aimed at an unknown tuple has nothing to abort and
    /// is dropped without creating one.
    pub fn dispatch(&self, pkt: Packet) {
        let quad = pkt.quad();
        let handler = {
            let mut connections = self.connections.lock();
            match connections.get(&quad) {
                Some(handler) => Arc::clone(handler),
                None => {
                    if pkt.rst() {
                        return;
                    }
                    let handler = self.create_handler(quad);
                    connections.insert(quad, Arc::clone(&handler));
                    handler
                }
            }
        };
        handler.handle_packet(pkt);
    }

    fn create_handler(&self, quad: Quad) -> Arc<Handler> {
        debug!("{quad}: new connection");
        let creator: StreamCreator = {
            let connector = Arc::clone(&self.connector);
            Box::new(move || connector(&quad))
        };
        let remove: Box<dyn FnOnce() + Send> = {
            let manager = self.weak_self.clone();
            Box::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.connections.lock().remove(&quad);
                    debug!("{quad}: removed from pool");
                }
            })
        };
        let handler = Handler::new(
            creator,
            Arc::clone(&self.closing),
            Arc::clone(&self.to_tun),
            quad,
            remove,
            SmallRng::from_entropy(),
        );
        handler.start();
        handler
    }

    /// First half of shutdown: refuse new work. The dispatcher loop exits
    /// when it observes this.
    pub fn begin_shutdown(&self) {
        self.closing.store(1, Ordering::SeqCst);
    }

    /// Second half: stop every remaining handler and mark the pool closed.
    pub fn finish_shutdown(&self) {
        let handlers: Vec<Arc<Handler>> = self.connections.lock().values().cloned().collect();
        for handler in handlers {
            handler.stop();
        }
        self.closing.store(2, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.begin_shutdown();
        self.finish_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::tests::{peer_segment, test_quad, wait_until, RecordingWriter, ScriptedStream};
    use crate::tcp::{State, TcpFlags};
    use crate::tunnel::Message;
    use std::sync::mpsc::{channel, Sender};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn pool_with_writer() -> (Arc<ConnectionManager>, Arc<RecordingWriter>) {
        let writer = RecordingWriter::new();
        // Keep the feed side of every scripted stream alive so the
        // handlers do not see an instant manager EOF.
        let feeds: Arc<Mutex<Vec<Sender<Message>>>> = Arc::new(Mutex::new(Vec::new()));
        let connector: StreamConnector = Arc::new(move |_quad: &Quad| {
            let (feed, inbox) = channel::<Message>();
            feeds.lock().push(feed);
            Ok(Arc::new(ScriptedStream::new(inbox)) as Arc<dyn Stream>)
        });
        let manager = ConnectionManager::new(connector, Arc::clone(&writer) as Arc<dyn Writer>);
        (manager, writer)
    }

    fn syn() -> Packet {
        peer_segment(
            &test_quad(),
            1000,
            0,
            TcpFlags::SYN,
            65535,
            &[],
            &[2, 4, 0x05, 0xb4],
        )
    }

    #[test]
    fn a_syn_creates_a_handler_slot() {
        let (manager, writer) = pool_with_writer();
        manager.dispatch(syn());
        assert_eq!(manager.len(), 1);
        writer
            .next_matching(WAIT, |p| p.syn() && p.ack())
            .expect("no SYN-ACK");
    }

    #[test]
    fn a_stray_rst_creates_nothing() {
        let (manager, _writer) = pool_with_writer();
        manager.dispatch(peer_segment(
            &test_quad(),
            1000,
            0,
            TcpFlags::RST,
            0,
            &[],
            &[],
        ));
        assert!(manager.is_empty());
    }

    #[test]
    fn an_in_window_rst_removes_the_slot() {
        let (manager, writer) = pool_with_writer();
        manager.dispatch(syn());
        let syn_ack = writer
            .next_matching(WAIT, |p| p.syn() && p.ack())
            .expect("no SYN-ACK");
        manager.dispatch(peer_segment(
            &test_quad(),
            1001,
            syn_ack.sequence().wrapping_add(1),
            TcpFlags::RST,
            65535,
            &[],
            &[],
        ));
        assert!(wait_until(WAIT, || manager.is_empty()));
    }

    #[test]
    fn shutdown_stops_established_handlers_and_refuses_new_ones() {
        let (manager, writer) = pool_with_writer();
        manager.dispatch(syn());
        let syn_ack = writer
            .next_matching(WAIT, |p| p.syn() && p.ack())
            .expect("no SYN-ACK");
        manager.dispatch(peer_segment(
            &test_quad(),
            1001,
            syn_ack.sequence().wrapping_add(1),
            TcpFlags::ACK,
            65535,
            &[],
            &[],
        ));
        let handler = {
            let connections = manager.connections.lock();
            Arc::clone(connections.values().next().expect("no slot"))
        };
        assert!(wait_until(WAIT, || handler.state() == State::Established));

        manager.shutdown();
        assert!(manager.is_closing());
        // The established connection starts an orderly close.
        writer
            .next_matching(WAIT, |p| p.fin())
            .expect("no FIN on shutdown");
        assert!(wait_until(WAIT, || handler.state() == State::FinWait1));

        // A new flow during shutdown is refused with a reset.
        let other = Quad {
            src: (test_quad().src.0, 50000),
            dst: test_quad().dst,
        };
        manager.dispatch(peer_segment(
            &other,
            7000,
            0,
            TcpFlags::SYN,
            65535,
            &[],
            &[],
        ));
        writer
            .next_matching(WAIT, |p| p.rst())
            .expect("no RST for a SYN during shutdown");
    }
}
