use bytes::{Buf, BufMut, Bytes, BytesMut};
use anyhow::bail;
use crate::frame_id::FrameId;
use crate::message_type::MessageType;

/// marker byte plus frame id
pub const FRAME_HEADER_LEN: usize = 1 + size_of::<u32>();

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_id: FrameId,
}

impl FrameHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(MessageType::RELIABLE_FRAME.id());
        buf.put_u32(self.frame_id.to_raw());
    }

    /// parses the header *after* the marker byte, which the caller already used to identify the
    ///  datagram as a frame
    pub fn deser_after_marker(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        if buf.remaining() < size_of::<u32>() {
            bail!("frame header is truncated");
        }
        let frame_id = FrameId::from_raw(buf.get_u32());
        Ok(FrameHeader { frame_id })
    }

    /// assembles a complete frame datagram
    pub fn frame(frame_id: FrameId, stream_chunk: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + stream_chunk.len());
        FrameHeader { frame_id }.ser(&mut buf);
        buf.put_slice(stream_chunk);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame() {
        let frame = FrameHeader::frame(FrameId::from_raw(0x01020304), &[9, 8, 7]);
        assert_eq!(frame.as_ref(), &[0xFF, 1, 2, 3, 4, 9, 8, 7]);

        let mut parse_buf = &frame[1..];
        let header = FrameHeader::deser_after_marker(&mut parse_buf).unwrap();
        assert_eq!(header.frame_id, FrameId::from_raw(0x01020304));
        assert_eq!(parse_buf, &[9, 8, 7]);
    }

    #[test]
    fn test_deser_truncated() {
        let mut parse_buf: &[u8] = &[0, 0, 1];
        assert!(FrameHeader::deser_after_marker(&mut parse_buf).is_err());
    }
}
