use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, span, trace, Instrument, Level, Span};
use uuid::Uuid;
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionOrigin};
use crate::message_type::MessageType;
use crate::peer_address::PeerAddress;
use crate::peer_manager::PeerManager;
use crate::registry::Registry;

/// Application callbacks for connections entering or leaving an [EndPoint]'s table
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    /// a peer started talking to us, or restarted its side of an existing connection
    async fn on_connected(&self, connection: Arc<Connection>);

    async fn on_disconnected(&self, peer: SocketAddr);
}

/// EndPoint owns the UDP socket and all connections going through it: it dispatches received
///  datagrams to their connections, creating connections for unknown peers, and drives all
///  connections' heartbeats.
pub struct EndPoint {
    weak_self: Weak<EndPoint>,
    config: Arc<TransportConfig>,
    registry: Arc<Registry>,
    socket: Arc<UdpSocket>,
    /// connections send synchronously, the send loop does the actual (async) sending
    send_queue: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    self_addr: SocketAddr,
    connections: RwLock<FxHashMap<SocketAddr, Arc<Connection>>>,
    listener: Arc<dyn ConnectionListener>,
    runtime: Handle,
}

impl EndPoint {
    pub async fn new(
        config: Arc<TransportConfig>,
        registry: Arc<Registry>,
        listener: Arc<dyn ConnectionListener>,
    ) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        let self_addr = socket.local_addr()?;
        info!("bound socket to {:?}", self_addr);

        let runtime = Handle::current();
        let (send_queue, send_receiver) = mpsc::unbounded_channel();
        runtime.spawn(Self::send_loop(socket.clone(), send_receiver));

        Ok(Arc::new_cyclic(|weak_self| EndPoint {
            weak_self: weak_self.clone(),
            config,
            registry,
            socket,
            send_queue,
            self_addr,
            connections: Default::default(),
            listener,
            runtime,
        }))
    }

    /// the address the socket is actually bound to, i.e. with the port filled in if the
    ///  configured port was 0
    pub fn local_addr(&self) -> SocketAddr {
        self.self_addr
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Opens a connection to `host[:port][?]`, see [PeerAddress]. If there is a connection to
    ///  the resolved address already, that connection is returned.
    pub async fn connect(&self, address: &str) -> anyhow::Result<Arc<Connection>> {
        let address = PeerAddress::parse(address, self.config.default_port)?;
        let peer_addr = address.resolve().await?;

        if let Some(existing) = self.connection(peer_addr) {
            debug!("already connected to {:?}", peer_addr);
            return Ok(existing);
        }

        info!("connecting to {} at {:?}", address, peer_addr);
        let connection = self.new_connection(peer_addr, ConnectionOrigin::Outgoing, address.port_guessing);
        self.register_connection(connection.clone());
        Ok(connection)
    }

    /// Creates a connection that sends through this end point. It does not receive anything
    ///  before it is registered.
    pub fn new_connection(&self, peer_addr: SocketAddr, origin: ConnectionOrigin, port_guessing: bool) -> Arc<Connection> {
        let manager: Weak<dyn PeerManager> = self.weak_self.clone();
        Arc::new(Connection::new(
            peer_addr,
            origin,
            port_guessing,
            self.config.clone(),
            self.registry.clone(),
            manager,
        ))
    }

    /// Adds a connection to the table under its peer address, returning the connection it
    ///  replaces, if any
    pub fn register_connection(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let peer_addr = connection.peer_addr();
        let previous = self.connections.write().unwrap()
            .insert(peer_addr, connection);
        if previous.is_some() {
            debug!("replaced connection to {:?}", peer_addr);
        }
        previous
    }

    /// Removes a connection from the table without closing it
    pub fn remove_connection(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        let removed = self.connections.write().unwrap()
            .remove(&peer);
        if removed.is_some() {
            debug!("removed connection to {:?}", peer);
            self.notify_disconnected(peer);
        }
        removed
    }

    pub fn connection(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.read().unwrap()
            .get(&peer)
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Passes a datagram to the connection for its sender, creating a connection if the sender
    ///  is unknown.
    pub fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        // the table lock must be released before the connection processes the datagram: handlers
        //  may close the connection, which removes it from the table
        let existing = self.connection(from);
        let connection = match existing {
            Some(connection) => connection,
            None => match self.connection_for_unknown_peer(from, datagram) {
                Some(connection) => connection,
                None => return,
            },
        };
        connection.receive(datagram);
    }

    fn connection_for_unknown_peer(&self, from: SocketAddr, datagram: &[u8]) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().unwrap();
        if let Some(connection) = connections.get(&from) {
            // registered concurrently
            return Some(connection.clone());
        }

        let guessing = connections.iter()
            .find(|(addr, connection)| addr.ip() == from.ip() && connection.is_port_guessing())
            .map(|(&addr, connection)| (addr, connection.clone()));
        if let Some((guessed_addr, connection)) = guessing {
            connections.remove(&guessed_addr);
            connection.adopt_port(from.port());
            connections.insert(from, connection.clone());
            return Some(connection);
        }

        // only a peer opening a connection creates one: stray heartbeats, redundant disconnect
        //  notifications or port probes from a departed peer must not
        match datagram.first().map(|&id| MessageType::new(id)) {
            Some(MessageType::RELIABLE_FRAME) => {}
            Some(t) if t == self.config.handshake_type => {}
            message_type => {
                trace!("{:?} datagram from unknown peer {:?} - ignoring", message_type, from);
                return None;
            }
        }

        debug!("datagram from unknown peer {:?} - creating connection", from);
        let connection = self.new_connection(from, ConnectionOrigin::Incoming, false);
        connections.insert(from, connection.clone());
        drop(connections);

        let listener = self.listener.clone();
        let new_connection = connection.clone();
        self.runtime.spawn(async move {
            listener.on_connected(new_connection).await
        }.instrument(Span::current()));

        Some(connection)
    }

    fn notify_disconnected(&self, peer: SocketAddr) {
        let listener = self.listener.clone();
        self.runtime.spawn(async move {
            listener.on_disconnected(peer).await
        }.instrument(Span::current()));
    }

    /// One heartbeat round for all connections, evicting connections whose peers fell silent
    pub fn on_heartbeat_tick(&self) {
        for connection in self.connections() {
            if let Some(timeout) = self.config.silence_timeout {
                let silent_for = connection.silent_for();
                if silent_for >= timeout {
                    info!("nothing received from {:?} for {:?} - closing the connection", connection.peer_addr(), silent_for);
                    connection.disconnect();
                    continue;
                }
            }
            connection.tick();
        }
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_unreliable_size.max(self.config.max_frame_size)];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            let _entered = span.enter();

            trace!("received datagram from {:?}: {:?}", from, &buf[..num_read]);
            self.on_datagram(from, &buf[..num_read]);
        }
    }

    pub async fn heartbeat_loop(&self) {
        info!("starting heartbeat loop");

        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.on_heartbeat_tick();
        }
    }

    async fn send_loop(socket: Arc<UdpSocket>, mut send_receiver: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        while let Some((to, datagram)) = send_receiver.recv().await {
            trace!("sending {} bytes to {:?}", datagram.len(), to);
            if let Err(e) = socket.send_to(&datagram, to).await {
                error!("error sending datagram to {:?}: {}", to, e);
            }
        }
        debug!("end point was dropped - send loop finished");
    }

    /// runs the receive loop and the heartbeat loop, never returning
    pub async fn run(&self) {
        tokio::join!(self.recv_loop(), self.heartbeat_loop());
    }
}

impl PeerManager for EndPoint {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        if self.send_queue.send((to, Bytes::copy_from_slice(datagram))).is_err() {
            error!("send loop terminated - dropping datagram to {:?}", to);
        }
    }

    fn remove_connection(&self, peer: SocketAddr) {
        let mut connections = self.connections.write().unwrap();
        // a replacement may have taken the closed connection's place already
        if connections.get(&peer).map_or(false, |c| c.is_disconnected()) {
            connections.remove(&peer);
            drop(connections);
            debug!("removed closed connection to {:?}", peer);
            self.notify_disconnected(peer);
        }
    }

    fn replace_connection(&self, peer: SocketAddr, first_datagram: Bytes) {
        let connection = self.new_connection(peer, ConnectionOrigin::Incoming, false);
        self.register_connection(connection.clone());
        connection.receive(&first_datagram);

        let listener = self.listener.clone();
        self.runtime.spawn(async move {
            listener.on_disconnected(peer).await;
            listener.on_connected(connection).await;
        }.instrument(Span::current()));
    }
}
