use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::message_type::MessageType;
use crate::wire::ack_ranges::AckRange;

/// Sent by both peers once per round. It carries the round counters that drive retransmission,
///  and acknowledges received frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatMessage {
    /// the sender's round counter
    pub local_round: u32,
    /// the latest round counter the sender received from its peer
    pub remote_round: u32,
    pub acked: Vec<AckRange>,
}

impl HeartbeatMessage {
    pub const FIXED_LEN: usize = 1 + 2*size_of::<u32>();
    pub const RANGE_LEN: usize = 2*size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(MessageType::HEARTBEAT.id());
        buf.put_u32(self.local_round);
        buf.put_u32(self.remote_round);
        for range in &self.acked {
            buf.put_u32(range.start);
            buf.put_u32(range.len);
        }
    }

    pub fn to_datagram(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_LEN + self.acked.len() * Self::RANGE_LEN);
        self.ser(&mut buf);
        buf.freeze()
    }

    /// parses the message *after* the message type byte. Incomplete trailing ranges are ignored.
    pub fn deser_after_marker(buf: &mut impl Buf) -> anyhow::Result<HeartbeatMessage> {
        if buf.remaining() < 2*size_of::<u32>() {
            bail!("heartbeat is too short for round counters: {} bytes", buf.remaining());
        }
        let local_round = buf.get_u32();
        let remote_round = buf.get_u32();

        let mut acked = Vec::with_capacity(buf.remaining() / Self::RANGE_LEN);
        while buf.remaining() >= Self::RANGE_LEN {
            let start = buf.get_u32();
            let len = buf.get_u32();
            acked.push(AckRange { start, len });
        }

        Ok(HeartbeatMessage {
            local_round,
            remote_round,
            acked,
        })
    }
}
