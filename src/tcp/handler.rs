//! The per-connection TCP endpoint.
//!
//! One handler terminates one flow seen on the TUN device: it answers the
//! handshake, acknowledges and orders inbound segments, retransmits unacked
//! outbound segments, respects the peer's flow-control window and bridges
//! payload to the manager stream in both directions.
//!
//! Concurrency: a processor thread consumes inbound packets, a ticker
//! thread drives retransmission, and a reader/writer thread pair moves
//! messages over the manager stream. All connection state lives behind one
//! mutex; helpers that have to block (TUN writes, manager hand-offs, window
//! waits) take the guard, drop it around the blocking call and hand a fresh
//! guard back, so preconditions are re-checked after every gap.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::rngs::SmallRng;
use rand::Rng;

use crate::cancel::Cancel;
use crate::quad::Quad;
use crate::tun::Writer;
use crate::tunnel::{Message, Stream, StreamCreator};

use super::options::{self, TcpOption};
use super::packet::{Packet, TCP_HEADER_LEN};
use super::queues::{AckWaitQueue, AckWaitRecord, OooQueue, OooRecord};
use super::state::State;
use super::timer::StopTimer;
use super::util::{seq_ge, seq_gt, seq_le, seq_lt};
use super::{IO_CHANNEL_SIZE, MAX_RECEIVE_WINDOW, MAX_SEGMENT_SIZE, MY_WINDOW_SCALE};

const INITIAL_RESEND_DELAY: Duration = Duration::from_millis(200);
const MAX_RESENDS: u32 = 7;
const RESEND_TICK: Duration = Duration::from_millis(100);
const TIME_WAIT_DURATION: Duration = Duration::from_secs(30);

/// How long a sender stalls on a too-small peer window before probing it
/// with a single byte.
const WINDOW_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Granularity at which blocked channel waits notice cancellation.
const CHANNEL_POLL: Duration = Duration::from_millis(100);

/// MSS assumed until the peer offers one (RFC 9293 default).
const FALLBACK_PEER_MSS: u16 = 536;

/// A sender stalled on the peer window. Registered while the stall lasts;
/// the ack path clears it and signals the condvar once the requested size
/// fits, and the waiter clears it itself on timeout or cancellation.
struct AwaitWinSize {
    rq_size: i64,
}

struct Inner {
    state: State,

    /// Next outbound byte's sequence number.
    sequence: u32,
    /// Highest contiguous sequence the peer has acknowledged.
    sequence_acked: u32,
    /// High watermark of peer sequences observed, including bytes that
    /// were dropped on their way to the manager. Successors of a dropped
    /// segment must count as dropped too, not as out-of-order.
    last_known: u32,
    /// Sequence the peer must ack to complete our FIN or RST.
    final_seq: u32,

    /// Peer sequence that the next outbound segment will acknowledge.
    peer_sequence_to_ack: u32,
    /// Peer sequence most recently acknowledged on the wire.
    peer_sequence_acked: u32,
    /// Peer's advertised window, descaled, minus bytes in flight.
    peer_window: i64,
    peer_window_scale: u8,
    peer_max_segment_size: u16,
    peer_permits_sack: bool,

    ack_wait_queue: AckWaitQueue,
    ooo_queue: OooQueue,

    await_win_size: Option<AwaitWinSize>,

    stream: Option<Arc<dyn Stream>>,
    to_mgr_tx: Option<SyncSender<Message>>,
    to_mgr_rx: Option<Receiver<Message>>,

    stop_timer: Option<Arc<StopTimer>>,
    rnd: SmallRng,

    // Anchors for relative offsets in log output.
    sq_start: u32,
    ack_start: u32,
}

/// The server half of one TCP connection, keyed by its 5-tuple.
pub struct Handler {
    id: Quad,
    weak_self: Weak<Handler>,

    inner: Mutex<Inner>,
    window_available: Condvar,

    /// Advertised receive window; read without the handler lock.
    my_window_size: AtomicU32,
    packets_lost: AtomicI64,

    cancel: Cancel,
    to_tun: Arc<dyn Writer>,
    stream_creator: StreamCreator,
    dispatcher_closing: Arc<AtomicI32>,
    remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,

    from_tun_tx: SyncSender<Packet>,
    from_tun_rx: Mutex<Option<Receiver<Packet>>>,
}

type Guard<'a> = MutexGuard<'a, Inner>;

impl Handler {
    pub fn new(
        stream_creator: StreamCreator,
        dispatcher_closing: Arc<AtomicI32>,
        to_tun: Arc<dyn Writer>,
        id: Quad,
        remove: Box<dyn FnOnce() + Send>,
        rnd: SmallRng,
    ) -> Arc<Handler> {
        let (from_tun_tx, from_tun_rx) = sync_channel(IO_CHANNEL_SIZE);
        let (to_mgr_tx, to_mgr_rx) = sync_channel(IO_CHANNEL_SIZE);
        Arc::new_cyclic(|weak_self| Handler {
            id,
            weak_self: weak_self.clone(),
            inner: Mutex::new(Inner {
                state: State::Listen,
                sequence: 0,
                sequence_acked: 0,
                last_known: 0,
                final_seq: 0,
                peer_sequence_to_ack: 0,
                peer_sequence_acked: 0,
                peer_window: 0,
                peer_window_scale: 0,
                peer_max_segment_size: FALLBACK_PEER_MSS,
                peer_permits_sack: false,
                ack_wait_queue: AckWaitQueue::default(),
                ooo_queue: OooQueue::default(),
                await_win_size: None,
                stream: None,
                to_mgr_tx: Some(to_mgr_tx),
                to_mgr_rx: Some(to_mgr_rx),
                stop_timer: None,
                rnd,
                sq_start: 0,
                ack_start: 0,
            }),
            window_available: Condvar::new(),
            my_window_size: AtomicU32::new(MAX_RECEIVE_WINDOW),
            packets_lost: AtomicI64::new(0),
            cancel: Cancel::default(),
            to_tun,
            stream_creator,
            dispatcher_closing,
            remove: Mutex::new(Some(remove)),
            from_tun_tx,
            from_tun_rx: Mutex::new(Some(from_tun_rx)),
        })
    }

    pub fn id(&self) -> &Quad {
        &self.id
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Segments the peer sent that never reached the manager.
    pub fn packets_lost(&self) -> i64 {
        self.packets_lost.load(Ordering::SeqCst)
    }

    /// Spawn the processor and retransmit threads. Call once, right after
    /// construction.
    pub fn start(&self) {
        let Some(handler) = self.weak_self.upgrade() else {
            return;
        };
        {
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler.run_resend_loop());
        }
        thread::spawn(move || handler.run_processor());
    }

    /// Entry point for the TUN dispatcher. Must not hold any handler lock;
    /// enqueues and returns (blocking only on inbound-channel backpressure).
    pub fn handle_packet(&self, pkt: Packet) {
        {
            let inner = self.inner.lock();
            if pkt.rst() && self.in_receive_window(&inner, pkt.sequence()) {
                drop(inner);
                debug!("{}: stopped by incoming RST", self.id);
                self.hard_stop();
                return;
            }
        }
        self.set_ack_and_peer_window_size(&pkt);
        if self.cancel.is_cancelled() {
            debug!("{}: inbound packet discarded, handler is cancelled", self.id);
            return;
        }
        if self.from_tun_tx.send(pkt).is_err() {
            debug!("{}: inbound packet discarded, processor is gone", self.id);
        }
    }

    /// Reply to `initial` with a reset. Used before a connection exists or
    /// when one cannot be established.
    pub fn reset(&self, initial: &Packet) {
        self.tun_write(&initial.reset_reply());
    }

    /// Orderly or abortive teardown, depending on the current state.
    pub fn stop(&self) {
        let inner = self.inner.lock();
        drop(self.stop_locked(inner));
    }

    fn stop_locked<'a>(&'a self, mut inner: Guard<'a>) -> Guard<'a> {
        match inner.state {
            State::Closed | State::TimeWait | State::LastAck => {
                debug!("{} stopped", self.id);
                drop(inner);
                self.hard_stop();
                self.inner.lock()
            }
            State::CloseWait => {
                self.set_state(&mut inner, State::LastAck);
                self.send_fin(inner, true)
            }
            State::Established | State::SynReceived => {
                debug!("{}: active close", self.id);
                self.set_state(&mut inner, State::FinWait1);
                self.send_fin(inner, true)
            }
            _ => {
                debug!("{}: stopped in state {}, sending RST", self.id, inner.state);
                inner = self.send_rst(inner);
                drop(inner);
                self.hard_stop();
                self.inner.lock()
            }
        }
    }

    /// Abortive teardown: remove from the pool, mark CLOSED, cancel every
    /// task. Idempotent through the single-shot remove reference.
    fn hard_stop(&self) {
        let Some(remove) = self.remove.lock().take() else {
            return;
        };
        remove();
        let (stream, timer) = {
            let mut inner = self.inner.lock();
            debug!("{}: state {} -> {}", self.id, inner.state, State::Closed);
            inner.state = State::Closed;
            inner.await_win_size = None;
            inner.to_mgr_tx = None;
            (inner.stream.take(), inner.stop_timer.take())
        };
        self.cancel.cancel();
        self.window_available.notify_all();
        if let Some(stream) = stream {
            let _ = stream.close();
        }
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    // ---- processor ----------------------------------------------------

    fn run_processor(self: Arc<Self>) {
        if let Some(rx) = self.from_tun_rx.lock().take() {
            let run = catch_unwind(AssertUnwindSafe(|| self.process_packets(&rx)));
            if let Err(payload) = run {
                error!(
                    "{}: packet processor panicked: {}",
                    self.id,
                    panic_message(&payload)
                );
            }
            // The cancel flag is the drain barrier: trip it first so no new
            // packets are accepted, then unblock any producer still queued.
            self.cancel.cancel();
            while rx.try_recv().is_ok() {}
        }
        {
            let mut inner = self.inner.lock();
            inner.ack_wait_queue.clear();
            inner.ooo_queue.clear();
        }
        debug!("{} closed", self.id);
        self.stop();
    }

    fn process_packets(&self, rx: &Receiver<Packet>) {
        loop {
            if self.cancel.is_cancelled() {
                debug!("{}: processor cancelled", self.id);
                return;
            }
            match rx.recv_timeout(CHANNEL_POLL) {
                Ok(pkt) => {
                    let inner = self.inner.lock();
                    if inner.state == State::Closed {
                        return;
                    }
                    drop(self.process(inner, pkt));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn process<'a>(&'a self, mut inner: Guard<'a>, pkt: Packet) -> Guard<'a> {
        inner = self.check_sack(inner, &pkt);
        match inner.state {
            // Stray packet or late duplicate.
            State::Closed | State::TimeWait => inner,
            State::Listen => self.listen(inner, pkt),
            _ => self.handle_received(inner, pkt),
        }
    }

    // ---- handshake -----------------------------------------------------

    fn listen<'a>(&'a self, mut inner: Guard<'a>, pkt: Packet) -> Guard<'a> {
        if !pkt.syn() {
            debug!("{}: first packet had no SYN, flags {:?}", self.id, pkt.flags());
            return self.refuse(inner, &pkt);
        }
        if self.dispatcher_closing.load(Ordering::SeqCst) != 0 {
            debug!("{}: dispatcher is closing, refusing new connection", self.id);
            return self.refuse(inner, &pkt);
        }
        let opts = match options::parse(pkt.options()) {
            Ok(opts) => opts,
            Err(err) => {
                debug!("{}: {}", self.id, err);
                return self.refuse(inner, &pkt);
            }
        };
        for opt in opts {
            match opt {
                TcpOption::MaxSegmentSize(mss) => {
                    inner.peer_max_segment_size = mss;
                    debug!("{}: peer maximum segment size {}", self.id, mss);
                }
                TcpOption::WindowScale(scale) => {
                    inner.peer_window_scale = scale;
                    debug!(
                        "{}: peer window scale {} (window {})",
                        self.id,
                        scale,
                        u32::from(pkt.window_size()) << scale
                    );
                }
                TcpOption::SackPermitted => {
                    trace!("{}: selective acknowledgments permitted", self.id);
                    inner.peer_permits_sack = true;
                }
                TcpOption::Timestamps { .. } => {
                    trace!("{}: peer sent timestamps, not used", self.id);
                }
                TcpOption::Sack(_) => {}
                TcpOption::Unknown { kind, len } => {
                    trace!("{}: option {} with len {}", self.id, kind, len);
                }
            }
        }

        inner.sequence = inner.rnd.gen::<u32>() >> 1;
        inner.sq_start = inner.sequence.wrapping_add(1);
        inner.ack_start = pkt.sequence().wrapping_add(1);
        // Anchor the loss watermark; comparisons against it are modular.
        inner.last_known = inner.ack_start;
        self.set_state(&mut inner, State::SynReceived);
        inner = self.send_syn_reply(inner, &pkt);

        match (self.stream_creator)() {
            Ok(stream) => {
                inner.stream = Some(Arc::clone(&stream));
                if let Some(handler) = self.weak_self.upgrade() {
                    if let Some(rx) = inner.to_mgr_rx.take() {
                        let writer = Arc::clone(&handler);
                        let writer_stream = Arc::clone(&stream);
                        thread::spawn(move || writer.write_to_mgr_loop(writer_stream, rx));
                    }
                    thread::spawn(move || handler.read_from_mgr_loop(stream));
                }
                inner
            }
            Err(err) => {
                error!("{}: failed to open manager stream: {}", self.id, err);
                self.refuse(inner, &pkt)
            }
        }
    }

    /// Reset the sender of `pkt` and tear this handler down.
    fn refuse<'a>(&'a self, inner: Guard<'a>, pkt: &Packet) -> Guard<'a> {
        drop(inner);
        self.reset(pkt);
        self.hard_stop();
        self.inner.lock()
    }

    fn send_syn_reply<'a>(&'a self, mut inner: Guard<'a>, syn: &Packet) -> Guard<'a> {
        if !syn.syn() {
            return inner;
        }
        inner.peer_sequence_to_ack = syn.sequence().wrapping_add(1);
        self.send_syn(inner)
    }

    fn send_syn<'a>(&'a self, inner: Guard<'a>) -> Guard<'a> {
        let hl = TCP_HEADER_LEN + options::SYN_REPLY_OPTIONS_LEN;
        let mut pkt = Packet::reply(&self.id, hl, 0);
        pkt.set_syn(true);
        pkt.set_ack(true);
        options::write_syn_reply(pkt.options_mut(), MAX_SEGMENT_SIZE as u16, MY_WINDOW_SCALE);
        self.send_to_tun(inner, pkt, 1)
    }

    // ---- inbound classification ---------------------------------------

    fn handle_received<'a>(&'a self, inner: Guard<'a>, pkt: Packet) -> Guard<'a> {
        if !(pkt.ack() || pkt.fin()) {
            debug!("{}: neither ACK nor FIN set, dropped", self.id);
            return inner;
        }
        let sq = pkt.sequence();
        if sq == inner.peer_sequence_acked {
            self.handle_sequence_eq(inner, pkt)
        } else if seq_gt(sq, inner.peer_sequence_acked) {
            self.handle_sequence_gt(inner, pkt)
        } else {
            self.handle_sequence_lt(inner, pkt)
        }
    }

    fn handle_sequence_eq<'a>(&'a self, mut inner: Guard<'a>, pkt: Packet) -> Guard<'a> {
        let state = inner.state;
        let payload_len = pkt.payload_len();
        let sq = pkt.sequence();

        if payload_len > 0 {
            let (guard, ok) = self.send_to_mgr(inner, &pkt);
            inner = guard;
            if ok {
                inner = self.process_out_of_order(inner, sq.wrapping_add(payload_len as u32));
                inner = self.send_ack(inner);
                inner.last_known = inner.peer_sequence_acked;
            } else {
                // Dropped toward the manager. Not acked, so the peer will
                // retransmit; successors must not land in the OOO queue.
                let end = sq.wrapping_add(payload_len as u32);
                if seq_gt(end, inner.last_known) {
                    inner.last_known = end;
                }
                self.note_lost_packet(&inner, &pkt);
            }
            return inner;
        }

        if pkt.fin() {
            inner.peer_sequence_to_ack = sq.wrapping_add(1);
            match state {
                State::Established => {
                    // Peer closes first. Our own FIN follows once the
                    // manager stream winds down.
                    self.set_state(&mut inner, State::CloseWait);
                    inner.to_mgr_tx = None;
                    inner = self.send_ack(inner);
                }
                State::FinWait1 => {
                    inner = self.send_ack(inner);
                    if pkt.ack() {
                        self.arm_stop_timer(&mut inner);
                        self.set_state(&mut inner, State::TimeWait);
                    } else {
                        // Simultaneous close; the peer's ack of our FIN is
                        // still on its way.
                        self.set_state(&mut inner, State::Closing);
                    }
                }
                State::FinWait2 => {
                    self.arm_stop_timer(&mut inner);
                    self.set_state(&mut inner, State::TimeWait);
                    inner = self.send_ack(inner);
                }
                _ => {}
            }
            return inner;
        }

        // A plain ACK.
        let an = pkt.ack_number();
        match state {
            State::SynSent => {
                if pkt.syn() {
                    inner = self.send_ack(inner);
                    self.set_state(&mut inner, State::Established);
                }
            }
            State::SynReceived => {
                self.set_state(&mut inner, State::Established);
            }
            State::LastAck => {
                if an == inner.final_seq {
                    self.set_state(&mut inner, State::Closed);
                    inner = self.stop_locked(inner);
                }
            }
            State::Closing => {
                if an == inner.final_seq {
                    self.arm_stop_timer(&mut inner);
                    self.set_state(&mut inner, State::TimeWait);
                }
            }
            State::FinWait1 => {
                if an == inner.final_seq {
                    self.arm_stop_timer(&mut inner);
                    self.set_state(&mut inner, State::FinWait2);
                }
            }
            _ => {}
        }
        inner
    }

    fn handle_sequence_gt<'a>(&'a self, mut inner: Guard<'a>, pkt: Packet) -> Guard<'a> {
        let payload_len = pkt.payload_len();
        let sq = pkt.sequence();
        if seq_le(sq, inner.last_known) {
            // Continuation of bytes we already dropped. Track, don't ack.
            if payload_len > 0 {
                let end = sq.wrapping_add(payload_len as u32);
                if seq_gt(end, inner.last_known) {
                    inner.last_known = end;
                    self.note_lost_packet(&inner, &pkt);
                }
            }
            return inner;
        }
        if payload_len > 0 {
            // A gap: tell the sender what we still expect, and which later
            // ranges already arrived.
            trace!(
                "{}: sq {}, an {}, wz {}, len {}, flags {:?}, ack-diff {}",
                self.id,
                sq.wrapping_sub(inner.ack_start),
                pkt.ack_number().wrapping_sub(inner.sq_start),
                pkt.window_size(),
                payload_len,
                pkt.flags(),
                sq.wrapping_sub(inner.peer_sequence_acked)
            );
            if inner.peer_permits_sack {
                inner.ooo_queue.insert(OooRecord {
                    sequence: sq,
                    ctime: Instant::now(),
                    packet: pkt,
                });
                trace!(
                    "{}: {} out-of-order segments buffered",
                    self.id,
                    inner.ooo_queue.len()
                );
            }
            inner = self.send_ack(inner);
        }
        inner
    }

    fn handle_sequence_lt<'a>(&'a self, inner: Guard<'a>, pkt: Packet) -> Guard<'a> {
        let sq = pkt.sequence();
        if sq == inner.peer_sequence_acked.wrapping_sub(1) && pkt.payload_len() == 0 {
            match inner.state {
                State::CloseWait | State::LastAck => {
                    // Our FIN is out; this is a repeat. Re-ack it in case
                    // the previous ack was lost, but nothing else.
                    if pkt.only_ack() {
                        return inner;
                    }
                }
                _ => {
                    if let Some(tx) = &inner.to_mgr_tx {
                        // Lossy by design: never block on a keep-alive.
                        if tx.try_send(Message::KeepAlive).is_ok() {
                            trace!("{}: keep-alive", self.id);
                        }
                    }
                }
            }
            return self.send_ack(inner);
        }
        if pkt.payload_len() > 0 {
            trace!(
                "{}: sq {}, len {} resends already acked data",
                self.id,
                sq.wrapping_sub(inner.ack_start),
                pkt.payload_len()
            );
        }
        inner
    }

    // ---- manager bridging ----------------------------------------------

    /// Hand an inbound segment's payload to the manager. Blocks on channel
    /// backpressure; fails when cancelled or when the outbound channel is
    /// already closed. Only a successful hand-off may advance the ack.
    fn send_to_mgr<'a>(&'a self, inner: Guard<'a>, pkt: &Packet) -> (Guard<'a>, bool) {
        let Some(tx) = inner.to_mgr_tx.clone() else {
            return (inner, false);
        };
        let payload = pkt.payload().to_vec();
        drop(inner);
        let ok = !self.cancel.is_cancelled() && tx.send(Message::Data(payload)).is_ok();
        (self.inner.lock(), ok)
    }

    /// Drain buffered out-of-order segments that became contiguous at
    /// `seq`, then move the ack mark to the end of the delivered run.
    fn process_out_of_order<'a>(&'a self, mut inner: Guard<'a>, mut seq: u32) -> Guard<'a> {
        loop {
            let Some(record) = inner.ooo_queue.pop_at(seq) else {
                break;
            };
            let end = seq.wrapping_add(record.packet.payload_len() as u32);
            trace!(
                "{}: delivering buffered segment sq {}, len {}",
                self.id,
                record.sequence.wrapping_sub(inner.ack_start),
                record.packet.payload_len()
            );
            let (guard, ok) = self.send_to_mgr(inner, &record.packet);
            inner = guard;
            if !ok {
                // The rest of the run stays unacked and comes back as
                // retransmissions.
                if seq_gt(end, inner.last_known) {
                    inner.last_known = end;
                }
                self.note_lost_packet(&inner, &record.packet);
                inner.peer_sequence_to_ack = seq;
                return inner;
            }
            seq = end;
        }
        inner.last_known = seq;
        inner.peer_sequence_to_ack = seq;
        inner
    }

    fn read_from_mgr_loop(self: Arc<Self>, stream: Arc<dyn Stream>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match stream.read_message() {
                Ok(Some(Message::Data(data))) => self.process_payload(&data),
                Ok(Some(Message::KeepAlive)) => trace!("{}: keep-alive from manager", self.id),
                Ok(None) => break,
                Err(err) => {
                    if !self.cancel.is_cancelled() {
                        debug!("{}: manager stream read: {}", self.id, err);
                    }
                    break;
                }
            }
        }
        self.on_mgr_stream_closed();
    }

    /// The manager side is done sending: answer with our FIN and move to
    /// the matching closing state.
    fn on_mgr_stream_closed(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Established => {
                self.set_state(&mut inner, State::FinWait1);
                inner = self.send_fin(inner, true);
            }
            State::CloseWait => {
                self.set_state(&mut inner, State::LastAck);
                inner = self.send_fin(inner, true);
            }
            _ => {}
        }
        drop(inner);
    }

    fn write_to_mgr_loop(self: Arc<Self>, stream: Arc<dyn Stream>, rx: Receiver<Message>) {
        loop {
            match rx.recv_timeout(CHANNEL_POLL) {
                Ok(msg) => {
                    if let Err(err) = stream.write_message(msg) {
                        if !self.cancel.is_cancelled() {
                            debug!("{}: manager stream write: {}", self.id, err);
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = stream.close();
    }

    // ---- outbound send path --------------------------------------------

    /// Segment one manager data message into MSS-sized packets and emit
    /// them, honoring the peer's window. Runs on the manager reader thread.
    fn process_payload(&self, data: &[u8]) {
        let mut start = 0;
        while start < data.len() {
            let inner = self.inner.lock();
            if inner.state == State::TimeWait || inner.state == State::Closed {
                break;
            }
            let (inner, next, pkt) = self.prepare_packet_from_payload(inner, data, start);
            drop(inner);
            match pkt {
                Some(pkt) => {
                    self.tun_write(&pkt);
                    start = next;
                }
                None => break,
            }
        }
    }

    fn prepare_packet_from_payload<'a>(
        &'a self,
        mut inner: Guard<'a>,
        data: &[u8],
        start: usize,
    ) -> (Guard<'a>, usize, Option<Packet>) {
        let remaining = data.len() - start;
        let mut mx_send = remaining.min(inner.peer_max_segment_size as usize);
        let window =
            inner.peer_window - i64::from(inner.sequence.wrapping_sub(inner.sequence_acked));
        if window < mx_send as i64 {
            // The receiver is not accepting this much right now.
            trace!(
                "{}: peer window too small ({} < {})",
                self.id,
                window,
                mx_send
            );
            let (guard, proceed, probe) = self.await_window_size(inner, mx_send as i64);
            inner = guard;
            if !proceed {
                return (inner, start, None);
            }
            if probe {
                // Zero window probe: one byte to solicit a window update.
                mx_send = 1;
            } else {
                trace!("{}: peer window is big enough", self.id);
            }
        }

        let mut pkt = self.new_response(&inner, mx_send);
        let end = start + mx_send;
        pkt.payload_mut().copy_from_slice(&data[start..end]);
        pkt.set_ack(true);
        pkt.set_psh(end == data.len());
        // Count the bytes against the window before the ack that confirms
        // them can arrive.
        inner.peer_window -= mx_send as i64;
        self.prepare_to_send(&mut inner, &mut pkt, mx_send as u32);
        (inner, end, Some(pkt))
    }

    /// Park the sender until the ack path signals that `rq_size` bytes fit
    /// in the peer window. Returns `(proceed, probe)`: on timeout the
    /// sender proceeds with a single-byte probe, on cancellation it stops.
    fn await_window_size<'a>(&'a self, mut inner: Guard<'a>, rq_size: i64) -> (Guard<'a>, bool, bool) {
        inner.await_win_size = Some(AwaitWinSize { rq_size });
        let deadline = Instant::now() + WINDOW_WAIT_TIMEOUT;
        loop {
            if self.cancel.is_cancelled() {
                inner.await_win_size = None;
                return (inner, false, false);
            }
            if inner.await_win_size.is_none() {
                // Granted and cleared by the ack path.
                let proceed = inner.state != State::Closed;
                return (inner, proceed, false);
            }
            if self
                .window_available
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                inner.await_win_size = None;
                return (inner, true, true);
            }
        }
    }

    /// Runs on the dispatcher thread for every inbound packet, ahead of the
    /// processor: cut the ack-wait queue, refresh the peer window and wake
    /// a stalled sender as soon as its request fits.
    fn set_ack_and_peer_window_size(&self, pkt: &Packet) {
        if !pkt.ack() {
            return;
        }
        let ack = pkt.ack_number();
        if ack == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        self.on_received_ack(&mut inner, ack);
        let window = i64::from(pkt.window_size()) << inner.peer_window_scale;
        inner.peer_window = window;
        let fulfillable = inner.await_win_size.as_ref().map_or(false, |waiting| {
            let available = window - i64::from(inner.sequence.wrapping_sub(ack));
            available >= waiting.rq_size
        });
        if fulfillable {
            inner.await_win_size = None;
            self.window_available.notify_all();
        }
    }

    fn on_received_ack(&self, inner: &mut Inner, ack: u32) {
        if seq_gt(ack, inner.sequence_acked) {
            inner.sequence_acked = ack;
        }
        let cut = inner.ack_wait_queue.cut_through(ack);
        if cut > 0 {
            trace!(
                "{}: ack {} released {} segments, {} awaiting",
                self.id,
                ack.wrapping_sub(inner.sq_start),
                cut,
                inner.ack_wait_queue.len()
            );
        }
    }

    // ---- packet construction and emission ------------------------------

    /// A reply packet for the current connection. When out-of-order
    /// segments are buffered it carries a SACK option advertising them,
    /// the block holding the most recently received segment first.
    fn new_response(&self, inner: &Inner, payload_len: usize) -> Packet {
        if inner.ooo_queue.is_empty() {
            return Packet::reply(&self.id, TCP_HEADER_LEN, payload_len);
        }
        let mut runs = inner.ooo_queue.runs();
        if let Some(freshest) = runs
            .iter()
            .enumerate()
            .max_by_key(|(_, run)| run.2)
            .map(|(i, _)| i)
        {
            if freshest > 0 {
                runs.swap(0, freshest);
            }
        }
        runs.truncate(options::MAX_SACK_BLOCKS);
        let blocks: Vec<(u32, u32)> = runs.iter().map(|run| (run.0, run.1)).collect();
        for (left, right) in &blocks {
            trace!(
                "{}: SACK {},{}",
                self.id,
                left.wrapping_sub(inner.ack_start),
                right.wrapping_sub(inner.ack_start)
            );
        }
        let hl = TCP_HEADER_LEN + options::sack_area_len(blocks.len());
        let mut pkt = Packet::reply(&self.id, hl, payload_len);
        options::write_sack(pkt.options_mut(), &blocks);
        pkt
    }

    fn send_ack<'a>(&'a self, inner: Guard<'a>) -> Guard<'a> {
        let mut pkt = self.new_response(&inner, 0);
        pkt.set_ack(true);
        self.send_to_tun(inner, pkt, 0)
    }

    fn send_fin<'a>(&'a self, mut inner: Guard<'a>, with_ack: bool) -> Guard<'a> {
        let mut pkt = Packet::reply(&self.id, TCP_HEADER_LEN, 0);
        pkt.set_psh(true);
        pkt.set_fin(true);
        pkt.set_ack(with_ack);
        inner.final_seq = inner.sequence.wrapping_add(1);
        self.send_to_tun(inner, pkt, 1)
    }

    fn send_rst<'a>(&'a self, mut inner: Guard<'a>) -> Guard<'a> {
        let mut pkt = Packet::reply(&self.id, TCP_HEADER_LEN, 0);
        pkt.set_rst(true);
        inner.final_seq = inner.sequence.wrapping_add(1);
        self.send_to_tun(inner, pkt, 1)
    }

    fn send_to_tun<'a>(&'a self, mut inner: Guard<'a>, mut pkt: Packet, seq_add: u32) -> Guard<'a> {
        self.prepare_to_send(&mut inner, &mut pkt, seq_add);
        self.tun_write_unlocked(inner, pkt)
    }

    /// Stamp sequence, ack, window and checksum onto an outbound packet.
    /// A packet that consumes sequence space goes onto the ack-wait queue.
    fn prepare_to_send(&self, inner: &mut Inner, pkt: &mut Packet, seq_add: u32) {
        let seq = inner.sequence;
        let ack_nbr = inner.peer_sequence_to_ack;
        pkt.set_sequence(seq);
        pkt.set_ack_number(ack_nbr);
        pkt.set_window_size((self.receive_window() >> MY_WINDOW_SCALE) as u16);
        pkt.set_checksum();
        inner.peer_sequence_acked = ack_nbr;
        if seq_add > 0 {
            inner.sequence = inner.sequence.wrapping_add(seq_add);
            inner.ack_wait_queue.push(AckWaitRecord {
                sequence: inner.sequence,
                retries: 0,
                ctime: Instant::now(),
                packet: pkt.clone(),
            });
            if inner.ack_wait_queue.len() % 200 == 0 {
                trace!(
                    "{}: ack-wait queue size {}, seq {}, peer window {}",
                    self.id,
                    inner.ack_wait_queue.len(),
                    inner.sequence.wrapping_sub(inner.sq_start),
                    inner.peer_window - i64::from(inner.sequence.wrapping_sub(inner.sequence_acked))
                );
            }
        }
    }

    fn tun_write_unlocked<'a>(&'a self, inner: Guard<'a>, pkt: Packet) -> Guard<'a> {
        drop(inner);
        self.tun_write(&pkt);
        self.inner.lock()
    }

    fn tun_write(&self, pkt: &Packet) {
        if let Err(err) = self.to_tun.write(pkt.as_bytes()) {
            error!("{}: TUN write failed: {}", self.id, err);
            self.hard_stop();
        }
    }

    // ---- retransmission ------------------------------------------------

    fn run_resend_loop(self: Arc<Self>) {
        let run = catch_unwind(AssertUnwindSafe(|| self.resend_loop()));
        if let Err(payload) = run {
            error!(
                "{}: retransmit loop panicked: {}",
                self.id,
                panic_message(&payload)
            );
        }
    }

    fn resend_loop(&self) {
        loop {
            if self.cancel.sleep(RESEND_TICK) {
                return;
            }
            if self.inner.lock().state == State::Closed {
                return;
            }
            self.resend_scan(Instant::now());
        }
    }

    /// One pass over the ack-wait queue, oldest segment first. The lock is
    /// dropped for every device write, so each step revalidates against
    /// acks that arrived in the gap; the cursor keeps the walk in ascending
    /// sequence order regardless.
    fn resend_scan(&self, now: Instant) {
        enum Step {
            Skip,
            Resend(Packet, Duration),
            GiveUp(u32, u32),
        }
        let mut cursor = None;
        loop {
            let mut inner = self.inner.lock();
            if inner.state == State::Closed {
                return;
            }
            let acked = inner.sequence_acked;
            let sack = inner.peer_permits_sack;
            let step = {
                let Some(record) = inner.ack_wait_queue.oldest_after(cursor) else {
                    return;
                };
                cursor = Some(record.sequence);
                if seq_le(record.packet.sequence(), acked) {
                    Step::Skip
                } else {
                    let mut backoff = INITIAL_RESEND_DELAY * (1 << record.retries);
                    if sack {
                        // The peer reports losses through SACK, so the
                        // timeout is only a fallback for a full outage.
                        backoff *= 10;
                    }
                    if now < record.ctime + backoff {
                        Step::Skip
                    } else if record.retries < MAX_RESENDS {
                        record.retries += 1;
                        Step::Resend(record.packet.clone(), backoff)
                    } else {
                        Step::GiveUp(record.sequence, record.packet.sequence())
                    }
                }
            };
            match step {
                Step::Skip => {}
                Step::Resend(orig, backoff) => {
                    let pkt = self.prepare_to_resend(&inner, &orig);
                    trace!(
                        "{}: sq {}, resent after {:?}",
                        self.id,
                        orig.sequence().wrapping_sub(inner.sq_start),
                        backoff
                    );
                    drop(inner);
                    self.tun_write(&pkt);
                }
                Step::GiveUp(end_seq, start_seq) => {
                    error!(
                        "{}: sq {}, segment resent {} times, giving up",
                        self.id,
                        start_seq.wrapping_sub(inner.sq_start),
                        MAX_RESENDS
                    );
                    inner.ack_wait_queue.unlink(end_seq);
                }
            }
        }
    }

    /// Rebuild a queued segment for the wire: same flags, sequence and
    /// payload, but current ack, window and SACK state.
    fn prepare_to_resend(&self, inner: &Inner, orig: &Packet) -> Packet {
        let mut pkt = self.new_response(inner, orig.payload_len());
        pkt.copy_flags_from(orig);
        pkt.set_sequence(orig.sequence());
        pkt.set_ack_number(inner.peer_sequence_to_ack);
        pkt.set_window_size((self.receive_window() >> MY_WINDOW_SCALE) as u16);
        pkt.payload_mut().copy_from_slice(orig.payload());
        pkt.set_checksum();
        pkt
    }

    fn check_sack<'a>(&'a self, mut inner: Guard<'a>, pkt: &Packet) -> Guard<'a> {
        if !pkt.ack() {
            return inner;
        }
        let opts = match options::parse(pkt.options()) {
            Ok(opts) => opts,
            Err(err) => {
                debug!("{}: {}", self.id, err);
                return inner;
            }
        };
        for opt in opts {
            if let TcpOption::Sack(blocks) = opt {
                inner = self.on_received_sack(inner, &blocks);
            }
        }
        inner
    }

    /// The peer told us which later ranges it holds: everything between
    /// the cumulative ack and the first block, and between blocks, is
    /// missing. Resend those segments now and restart their backoff clock.
    fn on_received_sack<'a>(&'a self, mut inner: Guard<'a>, blocks: &[(u32, u32)]) -> Guard<'a> {
        let Some(&(first_left, _)) = blocks.first() else {
            return inner;
        };
        let mut right_edge = inner.sequence_acked;
        if seq_ge(right_edge, first_left) {
            // D-SACK: the peer reports a duplicate of data already acked.
            return inner;
        }
        let now = Instant::now();
        for &(left, right) in blocks {
            let mut gap: Vec<u32> = inner
                .ack_wait_queue
                .iter_mut()
                .filter(|r| seq_ge(r.sequence, right_edge) && seq_lt(r.sequence, left))
                .map(|r| {
                    r.ctime = now;
                    r.sequence
                })
                .collect();
            // The queue iterates newest first; resend in ascending order.
            gap.reverse();
            for end_seq in gap {
                inner = self.resend_gap_segment(inner, end_seq);
            }
            right_edge = right;
        }
        inner
    }

    fn resend_gap_segment<'a>(&'a self, inner: Guard<'a>, end_seq: u32) -> Guard<'a> {
        let pkt = {
            let acked = inner.sequence_acked;
            match inner
                .ack_wait_queue
                .iter()
                .find(|r| r.sequence == end_seq && seq_gt(r.packet.sequence(), acked))
            {
                Some(record) => {
                    let orig = record.packet.clone();
                    Some(self.prepare_to_resend(&inner, &orig))
                }
                None => None,
            }
        };
        match pkt {
            Some(pkt) => {
                trace!(
                    "{}: sq {}, resent on SACK gap",
                    self.id,
                    pkt.sequence().wrapping_sub(inner.sq_start)
                );
                self.tun_write_unlocked(inner, pkt)
            }
            None => inner,
        }
    }

    // ---- small shared pieces -------------------------------------------

    fn in_receive_window(&self, inner: &Inner, sq: u32) -> bool {
        let left = inner.peer_sequence_acked;
        seq_ge(sq, left) && seq_lt(sq, left.wrapping_add(self.receive_window()))
    }

    fn receive_window(&self) -> u32 {
        self.my_window_size.load(Ordering::SeqCst)
    }

    fn note_lost_packet(&self, inner: &Inner, pkt: &Packet) {
        if pkt.payload_len() > 0 {
            let lost = self.packets_lost.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(
                "{}: sq {}, an {}, wz {}, len {}, flags {:?}, {} packets lost",
                self.id,
                pkt.sequence().wrapping_sub(inner.ack_start),
                pkt.ack_number().wrapping_sub(inner.sq_start),
                pkt.window_size(),
                pkt.payload_len(),
                pkt.flags(),
                lost
            );
        }
    }

    fn arm_stop_timer(&self, inner: &mut Inner) {
        if let Some(timer) = &inner.stop_timer {
            timer.reset(TIME_WAIT_DURATION);
        } else if let Some(handler) = self.weak_self.upgrade() {
            inner.stop_timer = Some(StopTimer::arm(TIME_WAIT_DURATION, move || {
                debug!("{}: TIME-WAIT timer expired", handler.id);
                handler.stop();
            }));
        }
    }

    fn set_state(&self, inner: &mut Inner, to: State) {
        if !inner.state.may_transition_to(to) {
            error!(
                "{}: illegal state transition {} -> {}",
                self.id, inner.state, to
            );
            return;
        }
        debug!("{}: state {} -> {}", self.id, inner.state, to);
        inner.state = to;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::packet::TcpFlags;
    use crate::tcp::tests::{establish, peer_segment, wait_until};
    use std::sync::atomic::Ordering;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn retransmit_exhaustion_unlinks_without_teardown() {
        let (conn, _isn) = establish(false);
        conn.feed.send(Message::Data(vec![9u8; 10])).unwrap();
        assert!(wait_until(WAIT, || conn
            .handler
            .inner
            .lock()
            .ack_wait_queue
            .len()
            == 1));
        {
            let mut inner = conn.handler.inner.lock();
            for record in inner.ack_wait_queue.iter_mut() {
                record.retries = MAX_RESENDS;
            }
        }
        // Scan far in the future so every backoff deadline has passed.
        conn.handler
            .resend_scan(Instant::now() + Duration::from_secs(3600));
        assert!(conn.handler.inner.lock().ack_wait_queue.is_empty());
        // Exhaustion gives the record up but keeps the connection.
        assert_eq!(conn.removed.load(Ordering::SeqCst), 0);
        assert_eq!(conn.handler.state(), State::Established);
    }

    #[test]
    fn a_sack_implied_gap_is_resent_immediately() {
        let (conn, isn) = establish(true);
        for _ in 0..3 {
            conn.feed.send(Message::Data(vec![b'q'; 100])).unwrap();
        }
        assert!(wait_until(WAIT, || conn
            .handler
            .inner
            .lock()
            .ack_wait_queue
            .len()
            == 3));
        conn.writer.drain();

        // The peer holds the third segment but is missing the first two.
        let mut sack = vec![0u8; options::sack_area_len(1)];
        options::write_sack(
            &mut sack,
            &[(isn.wrapping_add(201), isn.wrapping_add(301))],
        );
        conn.handler.handle_packet(peer_segment(
            &conn.quad,
            1001,
            isn.wrapping_add(1),
            TcpFlags::ACK,
            65535,
            &[],
            &sack,
        ));
        let resent = conn
            .writer
            .next_matching(WAIT, |p| p.payload_len() == 100)
            .expect("gap segment was not resent");
        assert_eq!(resent.sequence(), isn.wrapping_add(1));
        // Its backoff clock restarted.
        let inner = conn.handler.inner.lock();
        let refreshed = inner
            .ack_wait_queue
            .iter()
            .find(|r| r.sequence == isn.wrapping_add(101))
            .expect("record still queued");
        assert!(refreshed.ctime.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn a_dsack_causes_no_resend() {
        let (conn, isn) = establish(true);
        conn.feed.send(Message::Data(vec![b'r'; 100])).unwrap();
        assert!(wait_until(WAIT, || conn
            .handler
            .inner
            .lock()
            .ack_wait_queue
            .len()
            == 1));
        conn.writer.drain();

        // First block left edge at or below the cumulative ack: a report
        // of duplicated, already-acked data.
        let mut sack = vec![0u8; options::sack_area_len(1)];
        options::write_sack(&mut sack, &[(isn.wrapping_sub(50), isn.wrapping_add(1))]);
        conn.handler.handle_packet(peer_segment(
            &conn.quad,
            1001,
            isn.wrapping_add(1),
            TcpFlags::ACK,
            65535,
            &[],
            &sack,
        ));
        assert!(conn
            .writer
            .next_matching(Duration::from_millis(300), |p| p.payload_len() > 0)
            .is_none());
    }

    #[test]
    fn illegal_transitions_leave_the_state_alone() {
        let (conn, _isn) = establish(true);
        let mut inner = conn.handler.inner.lock();
        conn.handler.set_state(&mut inner, State::Listen);
        assert_eq!(inner.state, State::Established);
        conn.handler.set_state(&mut inner, State::TimeWait);
        assert_eq!(inner.state, State::Established);
    }

    #[test]
    fn a_lost_manager_handoff_is_not_acked_and_tracked() {
        let (conn, _isn) = establish(true);
        // Close the outbound channel under the handler to force hand-off
        // failure while the connection is otherwise healthy.
        conn.handler.inner.lock().to_mgr_tx = None;
        conn.writer.drain();
        conn.handler.handle_packet(peer_segment(
            &conn.quad,
            1001,
            0,
            TcpFlags::ACK,
            65535,
            &[b'x'; 100],
            &[],
        ));
        assert!(wait_until(WAIT, || conn.handler.packets_lost() == 1));
        let inner = conn.handler.inner.lock();
        // Not acknowledged, but remembered as seen-and-lost.
        assert_eq!(inner.peer_sequence_acked, 1001);
        assert_eq!(inner.last_known, 1101);
        drop(inner);
        // The follow-up segment counts as lost too instead of queueing.
        conn.handler.handle_packet(peer_segment(
            &conn.quad,
            1101,
            0,
            TcpFlags::ACK,
            65535,
            &[b'y'; 100],
            &[],
        ));
        assert!(wait_until(WAIT, || conn.handler.packets_lost() == 2));
        let inner = conn.handler.inner.lock();
        assert_eq!(inner.last_known, 1201);
        assert!(inner.ooo_queue.is_empty());
    }
}
