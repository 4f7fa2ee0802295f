//! A peer-to-peer messaging layer on top of UDP, multiplexing many logical message types over a
//!  single socket. It offers two kinds of delivery:
//!
//! * *reliable* messages are delivered at least once to the transport and exactly once to the
//!   application, in the order they were sent (per connection, across all message types)
//! * *unreliable* messages are sent as a single datagram, fire-and-forget. They are meant for
//!   high-frequency state updates where an old value is worthless once superseded
//!
//! ## Design
//!
//! * Reliable messages are written to a per-connection byte stream. The stream is cut into
//!   *frames* of a fixed maximum size independently of message boundaries, so a message can span
//!   many frames and a frame can carry parts of many messages
//! * Frames are not acknowledged individually. Instead, both peers send a *heartbeat* per
//!   round (every 100ms by default) containing the run-length encoded ids of all frames received
//!   during the last three rounds. Sending the same ids in three consecutive heartbeats makes the
//!   protocol robust against lost heartbeats
//! * A frame that is not acknowledged two rounds after it was sent is sent again
//! * The receiver buffers frames in a window of 65536 frames and dispatches a message once all
//!   of its bytes are available in sequence
//! * There is no congestion control, encryption or authentication
//!
//! ## Wire format
//!
//! All numbers in network byte order (BE), except the message length varint.
//!
//! Unreliable datagram:
//! ```ascii
//! 0: message type (u8)
//! 1: payload
//! ```
//!
//! Reliable frame:
//! ```ascii
//! 0: 0xFF
//! 1: frame id (u32)
//! 5: chunk of the reliable stream - a sequence of messages, cut at arbitrary positions:
//!    message type (u8)
//!    payload length (u32, LEB128 varint: 7 bits per byte, least significant group first,
//!     bit 7 set on all but the last byte)
//!    payload
//! ```
//!
//! Heartbeat:
//! ```ascii
//! 0: 0x00
//! 1: local round (u32) - the sender's heartbeat counter
//! 5: remote round (u32) - the last heartbeat counter the sender received from the peer
//! 9: (repeated) acknowledged range of frame ids: start (u32), length (u32)
//! ```
//!
//! ## Handshake
//!
//! Application traffic is held back until the application marks a connection's handshake as
//!  complete. Before that, only heartbeats, reliable frames and messages of the configured
//!  handshake type are processed, and only handshake messages are dispatched from the reliable
//!  stream. The handshake itself is application defined.

pub mod config;
pub mod message_type;
pub mod registry;
pub mod frame_id;
pub mod wire;
pub mod connection;
pub mod peer_manager;
pub mod peer_address;
pub mod end_point;

#[cfg(test)]
mod test_util;
