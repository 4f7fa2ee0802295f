//! Serialization of the transport's datagrams and of the message headers inside the reliable
//!  stream. See the crate documentation for the wire format.

pub mod frame;
pub mod message_header;
pub mod heartbeat;
pub mod ack_ranges;
