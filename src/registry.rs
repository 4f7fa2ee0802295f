use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use anyhow::bail;
#[cfg(test)] use mockall::automock;
use tracing::debug;
use crate::connection::Connection;
use crate::message_type::MessageType;

/// IP and UDP header bytes that are added to the counted datagram length
pub const DATAGRAM_OVERHEAD: u64 = 20 + 8;

/// Application code plugs into the transport by registering a handler per [MessageType].
///
/// Handlers are called synchronously from the thread delivering the datagram, and for reliable
///  messages while the connection's receive state is locked. They may send on the connection,
///  complete its handshake or disconnect it, but they must not pass datagrams to the same
///  connection's `receive`.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, connection: &Connection, payload: &[u8]);
}

/// The table of message handlers, indexed by message type id.
///
/// A registry is populated during setup and then shared by all connections. Apart from dispatch,
///  it keeps per-type statistics of received data for diagnostics.
pub struct Registry {
    handlers: Vec<Option<Arc<dyn MessageHandler>>>,
    bytes_received: Vec<AtomicU64>,
    packets_received: Vec<AtomicU64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let registered = self.registered_types().collect::<Vec<_>>();
        write!(f, "Registry{{{:?}}}", registered)
    }
}

impl Registry {
    const NUM_TYPES: usize = 256;

    pub fn new() -> Registry {
        Registry {
            handlers: vec![None; Self::NUM_TYPES],
            bytes_received: (0..Self::NUM_TYPES).map(|_| AtomicU64::new(0)).collect(),
            packets_received: (0..Self::NUM_TYPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Binds a handler to a message type. Binding a reserved type or a type that already has a
    ///  handler is a wiring error in the application.
    pub fn register(&mut self, message_type: MessageType, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        if message_type.is_reserved() {
            bail!("message type {:?} is reserved for the transport", message_type);
        }

        let slot = &mut self.handlers[message_type.index()];
        if slot.is_some() {
            bail!("registering a second handler for message type {:?}", message_type);
        }

        debug!("registering handler for message type {:?}", message_type);
        *slot = Some(handler);
        Ok(())
    }

    pub fn is_registered(&self, message_type: MessageType) -> bool {
        self.handlers[message_type.index()].is_some()
    }

    pub fn registered_types(&self) -> impl Iterator<Item = MessageType> + '_ {
        self.handlers.iter()
            .enumerate()
            .filter(|(_, h)| h.is_some())
            .map(|(id, _)| MessageType::new(id as u8))
    }

    /// lookup for message types that arrive from the network - these may well be unknown
    pub fn handler(&self, message_type: MessageType) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers[message_type.index()].as_ref()
    }

    /// Calls the handler for a message type that is known to be registered.
    ///
    /// NB: Calling this for a type without a handler is a bug in the protocol wiring, so it panics
    pub fn dispatch(&self, message_type: MessageType, connection: &Connection, payload: &[u8]) {
        self.handler(message_type)
            .unwrap_or_else(|| panic!("this is a bug: dispatching message type {:?} which has no registered handler", message_type))
            .on_message(connection, payload);
    }

    pub(crate) fn count_datagram(&self, message_type: MessageType, datagram_len: usize) {
        self.bytes_received[message_type.index()].fetch_add(datagram_len as u64 + DATAGRAM_OVERHEAD, Ordering::Relaxed);
        self.packets_received[message_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// counts a message extracted from the reliable stream, including its type byte
    pub(crate) fn count_reliable_message(&self, message_type: MessageType, payload_len: usize) {
        self.bytes_received[message_type.index()].fetch_add(payload_len as u64 + 1, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, message_type: MessageType) -> u64 {
        self.bytes_received[message_type.index()].load(Ordering::Relaxed)
    }

    pub fn packets_received(&self, message_type: MessageType) -> u64 {
        self.packets_received[message_type.index()].load(Ordering::Relaxed)
    }
}
