use std::net::SocketAddr;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// This is the capability a [crate::connection::Connection] has on the end point that owns it.
///  Connections hold it as a `Weak` reference, so they do not keep the end point alive.
///
/// All calls are synchronous and must not block: connections call them while holding their
///  internal locks.
#[cfg_attr(test, automock)]
pub trait PeerManager: Send + Sync + 'static {
    /// Fire-and-forget. A datagram that can not be sent is lost, reliable traffic is repaired by
    ///  retransmission
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    /// called when a connection was disconnected by either side
    fn remove_connection(&self, peer: SocketAddr);

    /// The peer restarted its side of the connection: the calling connection is finished, and
    ///  a new one should be created for the address and fed the datagram that triggered this.
    fn replace_connection(&self, peer: SocketAddr, first_datagram: Bytes);
}
