use bytes::{Buf, BufMut};
use bytes_varint::{VarIntError, VarIntSupport, VarIntSupportMut};
use crate::message_type::MessageType;

/// The header of a message inside the reliable stream. It is followed by `payload_len` bytes
///  of payload, and it may itself be split across frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub payload_len: u32,
}

/// Outcome of parsing a message header from the part of the reliable stream that is available
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderParseResult {
    Complete(MessageHeader),
    /// the header is not fully received yet
    Incomplete,
    /// the stream does not contain a valid header here, i.e. it is corrupt
    Corrupt,
}

impl MessageHeader {
    /// type byte plus the longest varint encoding of a u32
    pub const MAX_SERIALIZED_LEN: usize = 1 + 5;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type.id());
        buf.put_u32_varint(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> HeaderParseResult {
        if !buf.has_remaining() {
            return HeaderParseResult::Incomplete;
        }
        let message_type = MessageType::new(buf.get_u8());

        match buf.try_get_u32_varint() {
            Ok(payload_len) => HeaderParseResult::Complete(MessageHeader { message_type, payload_len }),
            Err(VarIntError::BufferUnderflow) => HeaderParseResult::Incomplete,
            Err(_) => HeaderParseResult::Corrupt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, vec![7, 0])]
    #[case::one_byte_max(0x7f, vec![7, 0x7f])]
    #[case::two_bytes(0x80, vec![7, 0x80, 0x01])]
    #[case::two_bytes_max(0x3fff, vec![7, 0xff, 0x7f])]
    #[case::three_bytes(300_000, vec![7, 0xe0, 0xa7, 0x12])]
    #[case::max(u32::MAX, vec![7, 0xff, 0xff, 0xff, 0xff, 0x0f])]
    fn test_ser_deser(#[case] payload_len: u32, #[case] expected: Vec<u8>) {
        let header = MessageHeader { message_type: MessageType::new(7), payload_len };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut parse_buf: &[u8] = &buf;
        assert_eq!(MessageHeader::deser(&mut parse_buf), HeaderParseResult::Complete(header));
        assert!(parse_buf.is_empty());
    }

    #[rstest]
    #[case::empty(vec![], HeaderParseResult::Incomplete)]
    #[case::type_only(vec![7], HeaderParseResult::Incomplete)]
    #[case::unfinished_varint(vec![7, 0x80, 0x80], HeaderParseResult::Incomplete)]
    #[case::overflow(vec![7, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01], HeaderParseResult::Corrupt)]
    fn test_deser_partial(#[case] buf: Vec<u8>, #[case] expected: HeaderParseResult) {
        let mut parse_buf: &[u8] = &buf;
        assert_eq!(MessageHeader::deser(&mut parse_buf), expected);
    }
}
