use std::fmt::{Debug, Formatter};

/// The first byte of every datagram and of every message in the reliable stream, identifying
///  the kind of message and thereby the handler that processes it.
///
/// Two values are reserved for the transport's own use: [MessageType::HEARTBEAT] and
///  [MessageType::RELIABLE_FRAME]. All others are available to applications.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageType(u8);

impl MessageType {
    pub const HEARTBEAT: MessageType = MessageType(0x00);
    pub const RELIABLE_FRAME: MessageType = MessageType(0xFF);

    pub const fn new(id: u8) -> MessageType {
        MessageType(id)
    }

    pub const fn id(&self) -> u8 {
        self.0
    }

    pub fn is_reserved(&self) -> bool {
        *self == Self::HEARTBEAT || *self == Self::RELIABLE_FRAME
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        MessageType(value)
    }
}

impl Debug for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::HEARTBEAT => write!(f, "HEARTBEAT"),
            Self::RELIABLE_FRAME => write!(f, "RELIABLE_FRAME"),
            MessageType(id) => write!(f, "0x{:02X}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::heartbeat(MessageType::HEARTBEAT, true, "HEARTBEAT")]
    #[case::frame(MessageType::RELIABLE_FRAME, true, "RELIABLE_FRAME")]
    #[case::regular(MessageType::new(7), false, "0x07")]
    #[case::almost_frame(MessageType::new(0xFE), false, "0xFE")]
    fn test_reserved(#[case] message_type: MessageType, #[case] expected_reserved: bool, #[case] expected_debug: &str) {
        assert_eq!(message_type.is_reserved(), expected_reserved);
        assert_eq!(format!("{:?}", message_type), expected_debug);
    }
}
