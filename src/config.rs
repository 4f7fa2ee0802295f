use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::message_type::MessageType;
use crate::wire::frame::FRAME_HEADER_LEN;
use crate::wire::message_header::MessageHeader;

pub struct TransportConfig {
    pub self_addr: SocketAddr,

    /// This is the size of a reliable frame including its 5 byte header, i.e. the UDP payload
    ///  size. The transport never relies on IP-level fragmentation, so this must be supported by
    ///  all network routes between peers.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPV4.
    pub max_frame_size: usize,

    /// The number of frames the receiver buffers ahead of the first frame that is not fully
    ///  dispatched. Frames further ahead are dropped (and not acknowledged).
    pub receive_window_size: u32,

    pub max_message_size: u32,

    /// Unreliable messages are sent as a single datagram, so they are bounded by the maximum
    ///  UDP payload.
    pub max_unreliable_size: usize,

    pub heartbeat_interval: Duration,

    /// A frame is re-sent if the peer's heartbeats show it was not received this many rounds
    ///  after it was sent
    pub resend_after_rounds: u32,

    /// Connections that did not receive anything for this long are evicted by the end point.
    ///  `None` disables eviction.
    pub silence_timeout: Option<Duration>,

    pub handshake_type: MessageType,
    pub disconnect_type: MessageType,
    pub disconnect_notifications: usize,

    /// number of port pairs (above and below the configured port) probed per heartbeat round
    ///  for connections in port guessing mode
    pub port_guess_probes_per_round: u16,

    /// used for peer addresses without an explicit port
    pub default_port: u16,
}

impl TransportConfig {
    pub const DEFAULT_PORT: u16 = 47649;

    /// defaults for IPV4 with end-to-end full Ethernet MTU, without optional headers
    pub fn default_ipv4(self_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            self_addr,
            max_frame_size: 1500 - 20 - 8,
            receive_window_size: 65536,
            max_message_size: 16*1024*1024,
            max_unreliable_size: 65507,
            heartbeat_interval: Duration::from_millis(100),
            resend_after_rounds: 2,
            silence_timeout: Some(Duration::from_secs(10)),
            handshake_type: MessageType::new(1),
            disconnect_type: MessageType::new(2),
            disconnect_notifications: 3,
            port_guess_probes_per_round: 5,
            default_port: Self::DEFAULT_PORT,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_size <= FRAME_HEADER_LEN {
            bail!("max frame size must be bigger than the frame header of {} bytes", FRAME_HEADER_LEN);
        }
        if self.max_frame_size > self.max_unreliable_size {
            bail!("max frame size {} exceeds the maximum datagram size {}", self.max_frame_size, self.max_unreliable_size);
        }
        if self.receive_window_size == 0 {
            bail!("receive window must not be empty");
        }
        // a message must fit into the receive window to ever be reassembled
        let window_capacity = self.receive_window_size as u64 * self.frame_payload_capacity() as u64;
        if self.max_message_size as u64 + MessageHeader::MAX_SERIALIZED_LEN as u64 > window_capacity {
            bail!("max message size {} does not fit into the receive window of {} frames with {} bytes each", self.max_message_size, self.receive_window_size, self.frame_payload_capacity());
        }
        if self.resend_after_rounds == 0 {
            bail!("resending frames in the round they were sent is not supported");
        }
        if self.handshake_type.is_reserved() {
            bail!("handshake type {:?} is reserved", self.handshake_type);
        }
        if self.disconnect_type.is_reserved() {
            bail!("disconnect type {:?} is reserved", self.disconnect_type);
        }
        if self.handshake_type == self.disconnect_type {
            bail!("handshake and disconnect must have different message types");
        }
        Ok(())
    }

    /// the number of stream bytes that fit into a single frame
    pub fn frame_payload_capacity(&self) -> usize {
        self.max_frame_size - FRAME_HEADER_LEN
    }
}
