//! The per-peer state machine: reliable and unreliable sending, heartbeats, retransmission
//!  and reassembly of the reliable stream.
//!
//! A [Connection] is used concurrently by the end point's receive loop, by the heartbeat timer and
//!  by application code sending messages. All of its operations are synchronous and finish in
//!  bounded time: independent parts of its state have separate locks, and no lock is held while
//!  waiting for anything but another lock.
//!
//! Lock order, where locks are nested: `outbound` before `unconfirmed`, and `inbound` before
//!  `acks`.

pub mod ack_tracker;
pub mod inbound;
pub mod outbound;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use crate::config::TransportConfig;
use crate::connection::ack_tracker::AckTracker;
use crate::connection::inbound::{NextMessage, ReceiveWindow, StoreOutcome};
use crate::connection::outbound::{OutboundStream, UnconfirmedFrames};
use crate::frame_id::FrameId;
use crate::message_type::MessageType;
use crate::peer_manager::PeerManager;
use crate::registry::Registry;
use crate::wire::frame::FrameHeader;
use crate::wire::heartbeat::HeartbeatMessage;
use crate::wire::message_header::MessageHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// only handshake messages, heartbeats and frames are processed, and only handshake
    ///  messages are dispatched from the reliable stream
    AwaitingHandshake,
    Active,
    /// final: nothing is sent or processed, and buffers are released
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// created by this node addressing the peer
    Outgoing,
    /// created for a datagram from a previously unknown peer
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_resent: u64,
    pub unconfirmed_frames: usize,
    pub local_round: u32,
    pub remote_round: u32,
}

impl ConnectionStats {
    /// the share of frames that had to be re-sent, as an approximation of packet loss
    pub fn loss_ratio(&self) -> f64 {
        if self.frames_sent == 0 {
            return 0.0;
        }
        self.frames_resent as f64 / self.frames_sent as f64
    }
}

pub struct Connection {
    config: Arc<TransportConfig>,
    registry: Arc<Registry>,
    manager: Weak<dyn PeerManager>,
    origin: ConnectionOrigin,

    peer_addr: RwLock<SocketAddr>,
    /// the current search radius if the peer's port is being guessed
    port_guess_radius: Mutex<Option<u16>>,

    outbound: Mutex<OutboundStream>,
    unconfirmed: Mutex<UnconfirmedFrames>,
    inbound: Mutex<ReceiveWindow>,
    acks: Mutex<AckTracker>,

    /// the number of the next heartbeat this side sends; rounds start at 1
    local_round: AtomicU32,
    /// the latest round the peer sent us; 0 means we did not hear from the peer yet
    remote_round: AtomicU32,
    /// the latest of our rounds that the peer reported to have received
    remote_seen_round: AtomicU32,

    handshake_complete: AtomicBool,
    disconnected: AtomicBool,
    last_heard: Mutex<Instant>,

    frames_sent: AtomicU64,
    frames_resent: AtomicU64,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{peer:{:?}, origin:{:?}, state:{:?}}}", self.peer_addr(), self.origin, self.state())
    }
}

impl Connection {
    pub fn new(
        peer_addr: SocketAddr,
        origin: ConnectionOrigin,
        port_guessing: bool,
        config: Arc<TransportConfig>,
        registry: Arc<Registry>,
        manager: Weak<dyn PeerManager>,
    ) -> Connection {
        debug!("new {:?} connection to {:?}", origin, peer_addr);

        Connection {
            outbound: Mutex::new(OutboundStream::new(config.frame_payload_capacity())),
            unconfirmed: Default::default(),
            inbound: Mutex::new(ReceiveWindow::new(config.receive_window_size)),
            acks: Default::default(),
            config,
            registry,
            manager,
            origin,
            peer_addr: RwLock::new(peer_addr),
            port_guess_radius: Mutex::new(port_guessing.then_some(1)),
            local_round: AtomicU32::new(1),
            remote_round: AtomicU32::new(0),
            remote_seen_round: AtomicU32::new(0),
            handshake_complete: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            last_heard: Mutex::new(Instant::now()),
            frames_sent: AtomicU64::new(0),
            frames_resent: AtomicU64::new(0),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        *self.peer_addr.read().unwrap()
    }

    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_disconnected() {
            ConnectionState::Disconnected
        }
        else if self.is_handshake_complete() {
            ConnectionState::Active
        }
        else {
            ConnectionState::AwaitingHandshake
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// true once the peer's first heartbeat arrived
    pub fn has_heard_from_peer(&self) -> bool {
        self.remote_round.load(Ordering::Acquire) != 0
    }

    pub fn is_port_guessing(&self) -> bool {
        self.port_guess_radius.lock().unwrap().is_some()
    }

    /// time since the last datagram from the peer was processed, or since the connection was
    ///  created
    pub fn silent_for(&self) -> Duration {
        self.last_heard.lock().unwrap().elapsed()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_resent: self.frames_resent.load(Ordering::Relaxed),
            unconfirmed_frames: self.unconfirmed.lock().unwrap().len(),
            local_round: self.local_round.load(Ordering::Acquire),
            remote_round: self.remote_round.load(Ordering::Acquire),
        }
    }

    /// A port guessing probe was answered from `port`: that is the peer's actual port.
    pub fn adopt_port(&self, port: u16) {
        {
            let mut peer_addr = self.peer_addr.write().unwrap();
            info!("peer {:?} answered from port {} - adopting it", *peer_addr, port);
            peer_addr.set_port(port);
        }
        *self.port_guess_radius.lock().unwrap() = None;
    }

    /// Lifts the handshake gate. Reliable messages that were held back are dispatched right
    ///  away if the receive state is available, and on the next tick otherwise.
    pub fn complete_handshake(&self) {
        if self.is_disconnected() {
            return;
        }
        if self.handshake_complete.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("handshake with {:?} complete", self.peer_addr());

        if let Ok(mut inbound) = self.inbound.try_lock() {
            self.reassemble(&mut inbound);
        }
    }

    /// Appends a message to the reliable stream. It is sent when its frame is full, or on the
    ///  next tick at the latest.
    pub fn send_reliable(&self, message_type: MessageType, payload: &[u8]) -> anyhow::Result<()> {
        if self.is_disconnected() {
            trace!("connection to {:?} is closed - not sending reliable message {:?}", self.peer_addr(), message_type);
            return Ok(());
        }
        if message_type.is_reserved() {
            bail!("message type {:?} is reserved for the transport", message_type);
        }
        if payload.len() > self.config.max_message_size as usize {
            bail!("message of {} bytes exceeds the maximum message size of {} bytes", payload.len(), self.config.max_message_size);
        }

        let mut header_buf = BytesMut::with_capacity(MessageHeader::MAX_SERIALIZED_LEN);
        MessageHeader {
            message_type,
            payload_len: payload.len() as u32,
        }.ser(&mut header_buf);

        trace!("sending reliable message {:?} with {} bytes to {:?}", message_type, payload.len(), self.peer_addr());
        if let Err(e) = self.append_to_stream(&header_buf, payload) {
            error!("closing connection to {:?}: {}", self.peer_addr(), e);
            self.disconnect();
            return Err(e);
        }
        Ok(())
    }

    fn append_to_stream(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<()> {
        let mut outbound = self.outbound.lock().unwrap();
        let round = self.local_round.load(Ordering::Acquire);

        let mut on_frame = |frame_id: FrameId, frame: Bytes| self.send_new_frame(frame_id, frame, round);
        outbound.append(header, &mut on_frame)?;
        outbound.append(payload, &mut on_frame)
    }

    /// NB: must be called while holding the outbound lock, so frames are sent in order
    fn send_new_frame(&self, frame_id: FrameId, frame: Bytes, round: u32) {
        trace!("sending frame {} to {:?}", frame_id, self.peer_addr());
        self.send_datagram(&frame);
        self.unconfirmed.lock().unwrap().push(frame_id, frame, round);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Sends a message as a single datagram, without any delivery guarantees
    pub fn send_unreliable(&self, message_type: MessageType, payload: &[u8]) -> anyhow::Result<()> {
        if self.is_disconnected() {
            trace!("connection to {:?} is closed - not sending unreliable message {:?}", self.peer_addr(), message_type);
            return Ok(());
        }
        if message_type.is_reserved() {
            bail!("message type {:?} is reserved for the transport", message_type);
        }
        if payload.len() + 1 > self.config.max_unreliable_size {
            bail!("unreliable message of {} bytes does not fit into a datagram of {} bytes", payload.len(), self.config.max_unreliable_size);
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.put_u8(message_type.id());
        buf.put_slice(payload);
        self.send_datagram(&buf);
        Ok(())
    }

    fn send_datagram(&self, datagram: &[u8]) {
        match self.manager.upgrade() {
            Some(manager) => manager.send_datagram(self.peer_addr(), datagram),
            None => debug!("end point is shut down - dropping datagram to {:?}", self.peer_addr()),
        }
    }

    /// The periodic heartbeat: acknowledges received frames, re-sends overdue frames and sends
    ///  buffered data.
    pub fn tick(&self) {
        if self.is_disconnected() {
            return;
        }

        self.send_heartbeat();
        self.resend_overdue_frames();

        if let Err(e) = self.flush() {
            error!("closing connection to {:?}: {}", self.peer_addr(), e);
            self.disconnect();
            return;
        }

        self.probe_ports();

        if let Ok(mut inbound) = self.inbound.try_lock() {
            self.reassemble(&mut inbound);
        }
    }

    fn send_heartbeat(&self) {
        let max_ranges = (self.config.max_unreliable_size - HeartbeatMessage::FIXED_LEN) / HeartbeatMessage::RANGE_LEN;
        let acked = self.acks.lock().unwrap().next_round(max_ranges);

        let heartbeat = HeartbeatMessage {
            local_round: self.local_round.fetch_add(1, Ordering::AcqRel),
            remote_round: self.remote_round.load(Ordering::Acquire),
            acked,
        };
        trace!("sending heartbeat to {:?}: {:?}", self.peer_addr(), heartbeat);
        self.send_datagram(&heartbeat.to_datagram());
    }

    fn resend_overdue_frames(&self) {
        let current_round = self.local_round.load(Ordering::Acquire);
        let remote_seen_round = self.remote_seen_round.load(Ordering::Acquire);

        let num_resent = self.unconfirmed.lock().unwrap()
            .resend_overdue(remote_seen_round, current_round, self.config.resend_after_rounds, |frame| {
                debug!("re-sending frame {} to {:?}", frame.frame_id, self.peer_addr());
                self.send_datagram(&frame.datagram);
            });
        self.frames_resent.fetch_add(num_resent as u64, Ordering::Relaxed);
    }

    fn flush(&self) -> anyhow::Result<()> {
        let mut outbound = self.outbound.lock().unwrap();
        if let Some((frame_id, frame)) = outbound.flush()? {
            self.send_new_frame(frame_id, frame, self.local_round.load(Ordering::Acquire));
        }
        Ok(())
    }

    fn probe_ports(&self) {
        let peer_addr = self.peer_addr();
        let mut port_guess_radius = self.port_guess_radius.lock().unwrap();
        let radius = match port_guess_radius.as_mut() {
            Some(radius) => radius,
            None => return,
        };
        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return,
        };

        trace!("probing ports around {:?} with radius {}", peer_addr, radius);
        for _ in 0..self.config.port_guess_probes_per_round {
            for port in [peer_addr.port().wrapping_add(*radius), peer_addr.port().wrapping_sub(*radius)] {
                if port != 0 {
                    manager.send_datagram(SocketAddr::new(peer_addr.ip(), port), &[]);
                }
            }
            *radius = radius.wrapping_add(1);
        }
    }

    /// Processes a datagram from the peer. Malformed or unexpected datagrams are dropped.
    pub fn receive(&self, datagram: &[u8]) {
        if self.is_disconnected() {
            trace!("connection to {:?} is closed - dropping datagram", self.peer_addr());
            return;
        }

        let message_type = match datagram.first() {
            Some(&id) => MessageType::new(id),
            None => {
                trace!("empty datagram from {:?} - port probe", self.peer_addr());
                return;
            }
        };

        if !self.is_handshake_complete() && !self.passes_handshake_gate(message_type) {
            debug!("dropping message of type {:?} from {:?} before the handshake is complete", message_type, self.peer_addr());
            return;
        }

        self.registry.count_datagram(message_type, datagram.len());
        *self.last_heard.lock().unwrap() = Instant::now();

        let body = &datagram[1..];
        match message_type {
            MessageType::RELIABLE_FRAME => self.on_frame(datagram, body),
            MessageType::HEARTBEAT => self.on_heartbeat(body),
            t if t == self.config.disconnect_type => self.on_disconnect_notification(t, body),
            t => self.on_unreliable_message(t, body),
        }
    }

    fn passes_handshake_gate(&self, message_type: MessageType) -> bool {
        message_type.is_reserved() || message_type == self.config.handshake_type
    }

    fn on_frame(&self, datagram: &[u8], mut body: &[u8]) {
        let frame_id = match FrameHeader::deser_after_marker(&mut body) {
            Ok(header) => header.frame_id,
            Err(e) => {
                debug!("dropping malformed frame from {:?}: {}", self.peer_addr(), e);
                return;
            }
        };
        if frame_id.is_exhausted() {
            debug!("dropping frame from {:?} with invalid id {}", self.peer_addr(), frame_id);
            return;
        }

        let mut inbound = self.inbound.lock().unwrap();
        if inbound.is_cleared() {
            return;
        }

        // a retransmission of frame 0 has the same content, a restarted peer's new stream does not
        if frame_id == FrameId::ZERO
            && self.is_handshake_complete()
            && inbound.has_received(frame_id)
            && !inbound.is_first_frame(body)
        {
            drop(inbound);
            self.on_peer_restart(datagram);
            return;
        }

        match inbound.store(frame_id, Bytes::copy_from_slice(body)) {
            StoreOutcome::BeyondWindow => {
                warn!("frame {} from {:?} is beyond the receive window starting at {} - dropping", frame_id, self.peer_addr(), inbound.cursor());
            }
            StoreOutcome::Duplicate => {
                trace!("duplicate frame {} from {:?}", frame_id, self.peer_addr());
                self.acks.lock().unwrap().record(frame_id);
            }
            StoreOutcome::Stored => {
                trace!("received frame {} from {:?}", frame_id, self.peer_addr());
                self.acks.lock().unwrap().record(frame_id);
                self.reassemble(&mut inbound);
            }
        }
    }

    /// dispatches all messages that are complete at the start of the window
    fn reassemble(&self, inbound: &mut ReceiveWindow) {
        loop {
            if self.is_disconnected() {
                inbound.clear();
                return;
            }

            let gate = if self.is_handshake_complete() {
                None
            }
            else {
                Some(self.config.handshake_type)
            };

            match inbound.next_message(gate, self.config.max_message_size) {
                NextMessage::Message(message_type, payload) => self.dispatch_reliable(message_type, &payload),
                NextMessage::Pending | NextMessage::HeldBack => return,
                NextMessage::Corrupt(reason) => {
                    error!("reliable stream from {:?} is corrupt: {} - closing the connection", self.peer_addr(), reason);
                    inbound.clear();
                    self.disconnect();
                    return;
                }
            }
        }
    }

    fn dispatch_reliable(&self, message_type: MessageType, payload: &[u8]) {
        self.registry.count_reliable_message(message_type, payload.len());

        if message_type.is_reserved() {
            debug!("skipping message with reserved type {:?} in the reliable stream from {:?}", message_type, self.peer_addr());
            return;
        }
        match self.registry.handler(message_type) {
            Some(handler) => handler.on_message(self, payload),
            None => debug!("no handler for reliable message type {:?} from {:?} - skipping", message_type, self.peer_addr()),
        }
    }

    fn on_heartbeat(&self, mut body: &[u8]) {
        let heartbeat = match HeartbeatMessage::deser_after_marker(&mut body) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                debug!("dropping malformed heartbeat from {:?}: {}", self.peer_addr(), e);
                return;
            }
        };
        trace!("received heartbeat from {:?}: {:?}", self.peer_addr(), heartbeat);

        self.remote_round.fetch_max(heartbeat.local_round, Ordering::AcqRel);
        self.remote_seen_round.fetch_max(heartbeat.remote_round, Ordering::AcqRel);

        let num_acked = self.unconfirmed.lock().unwrap()
            .acknowledge(&heartbeat.acked);
        if num_acked > 0 {
            trace!("{} frames acknowledged by {:?}", num_acked, self.peer_addr());
        }
    }

    fn on_unreliable_message(&self, message_type: MessageType, payload: &[u8]) {
        match self.registry.handler(message_type) {
            Some(handler) => handler.on_message(self, payload),
            None => debug!("no handler for message type {:?} from {:?} - dropping", message_type, self.peer_addr()),
        }
    }

    fn on_disconnect_notification(&self, message_type: MessageType, payload: &[u8]) {
        if let Some(handler) = self.registry.handler(message_type) {
            handler.on_message(self, payload);
        }

        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("peer {:?} disconnected", self.peer_addr());
        self.release_state();
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_connection(self.peer_addr());
        }
    }

    /// The peer started sending a new reliable stream: it was restarted and lost all state
    ///  for this connection. This connection is discarded, and a fresh one takes over.
    fn on_peer_restart(&self, datagram: &[u8]) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("peer {:?} restarted its connection - replacing it", self.peer_addr());
        self.release_state();
        if let Some(manager) = self.manager.upgrade() {
            manager.replace_connection(self.peer_addr(), Bytes::copy_from_slice(datagram));
        }
    }

    /// Closes the connection, notifying the peer with a few redundant datagrams of the configured
    ///  disconnect type. Calling this on a closed connection has no effect.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("disconnecting from {:?}", self.peer_addr());

        let notification = [self.config.disconnect_type.id()];
        for _ in 0..self.config.disconnect_notifications {
            self.send_datagram(&notification);
        }

        self.release_state();
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_connection(self.peer_addr());
        }
    }

    fn release_state(&self) {
        self.outbound.lock().unwrap().clear();
        self.unconfirmed.lock().unwrap().clear();
        self.acks.lock().unwrap().clear();

        // reassembly may be in progress on this thread, releasing the window when it sees the flag
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.clear();
        }
    }
}
