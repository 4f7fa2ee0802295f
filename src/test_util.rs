use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionOrigin};
use crate::message_type::MessageType;
use crate::peer_manager::PeerManager;
use crate::registry::{MessageHandler, Registry};

/// matches the default configuration
pub const HANDSHAKE: MessageType = MessageType::new(1);
pub const TYPE_A: MessageType = MessageType::new(7);

pub fn self_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4000))
}

pub fn peer_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

pub fn test_config() -> TransportConfig {
    TransportConfig::default_ipv4(self_addr())
}

#[derive(Default)]
pub struct CollectingPeerManager {
    pub sent: Mutex<Vec<(SocketAddr, Bytes)>>,
    pub removed: Mutex<Vec<SocketAddr>>,
    pub replaced: Mutex<Vec<(SocketAddr, Bytes)>>,
}
impl CollectingPeerManager {
    /// the datagrams sent so far, clearing the list
    pub fn take_sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap()
            .drain(..)
            .map(|(_, datagram)| datagram)
            .collect()
    }
}
impl PeerManager for CollectingPeerManager {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        self.sent.lock().unwrap().push((to, Bytes::copy_from_slice(datagram)));
    }

    fn remove_connection(&self, peer: SocketAddr) {
        self.removed.lock().unwrap().push(peer);
    }

    fn replace_connection(&self, peer: SocketAddr, first_datagram: Bytes) {
        self.replaced.lock().unwrap().push((peer, first_datagram));
    }
}

#[derive(Default)]
pub struct CollectingHandler {
    messages: Mutex<Vec<Vec<u8>>>,
}
impl CollectingHandler {
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().unwrap().clone()
    }
}
impl MessageHandler for CollectingHandler {
    fn on_message(&self, _connection: &Connection, payload: &[u8]) {
        self.messages.lock().unwrap().push(payload.to_vec());
    }
}

/// a registry with a collecting handler for a message type, open for further registrations
pub fn collecting_registry(message_type: MessageType) -> (Registry, Arc<CollectingHandler>) {
    let handler = Arc::new(CollectingHandler::default());
    let mut registry = Registry::new();
    registry.register(message_type, handler.clone())
        .expect("registering a handler in an empty registry");
    (registry, handler)
}

pub fn collecting_handler(message_type: MessageType) -> (Arc<Registry>, Arc<CollectingHandler>) {
    let (registry, handler) = collecting_registry(message_type);
    (Arc::new(registry), handler)
}

pub fn test_connection(registry: Arc<Registry>) -> (Connection, Arc<CollectingPeerManager>) {
    test_connection_with(test_config(), registry)
}

pub fn test_connection_with(config: TransportConfig, registry: Arc<Registry>) -> (Connection, Arc<CollectingPeerManager>) {
    connection_to(peer_addr(), Arc::new(config), registry)
}

fn connection_to(peer: SocketAddr, config: Arc<TransportConfig>, registry: Arc<Registry>) -> (Connection, Arc<CollectingPeerManager>) {
    let manager = Arc::new(CollectingPeerManager::default());
    let manager_dyn: Arc<dyn PeerManager> = manager.clone();
    let connection = Connection::new(
        peer,
        ConnectionOrigin::Outgoing,
        false,
        config,
        registry,
        Arc::downgrade(&manager_dyn),
    );
    (connection, manager)
}

/// Simulates a network path: datagrams are dropped at random, and surviving datagrams are
///  delayed by a random number of rounds, which reorders them.
pub struct LossyChannel {
    rng: StdRng,
    drop_rate: f64,
    max_delay: u32,
    in_flight: Vec<(u32, Bytes)>,
}
impl LossyChannel {
    pub fn new(seed: u64, drop_rate: f64) -> LossyChannel {
        LossyChannel {
            rng: StdRng::seed_from_u64(seed),
            drop_rate,
            max_delay: 2,
            in_flight: Vec::new(),
        }
    }

    /// Adds newly sent datagrams, and returns the datagrams that arrive in this round
    pub fn transmit(&mut self, sent: Vec<Bytes>) -> Vec<Bytes> {
        for datagram in sent {
            if self.rng.random_bool(self.drop_rate) {
                continue;
            }
            let delay = self.rng.random_range(0..=self.max_delay);
            self.in_flight.push((delay, datagram));
        }

        let mut arrived = Vec::new();
        let mut still_in_flight = Vec::new();
        for (delay, datagram) in self.in_flight.drain(..) {
            if delay == 0 {
                arrived.push(datagram);
            }
            else {
                still_in_flight.push((delay - 1, datagram));
            }
        }
        self.in_flight = still_in_flight;

        if self.max_delay > 0 {
            arrived.shuffle(&mut self.rng);
        }
        arrived
    }
}

/// delivers everything immediately and in order
pub fn lossless() -> LossyChannel {
    LossyChannel {
        rng: StdRng::seed_from_u64(0),
        drop_rate: 0.0,
        max_delay: 0,
        in_flight: Vec::new(),
    }
}

/// Two connections talking to each other through simulated channels
pub struct ConnectionPair {
    pub a: Connection,
    pub a_manager: Arc<CollectingPeerManager>,
    pub b: Connection,
    pub b_manager: Arc<CollectingPeerManager>,
}
impl ConnectionPair {
    pub fn new(config: TransportConfig, registry_a: Arc<Registry>, registry_b: Arc<Registry>) -> ConnectionPair {
        let config = Arc::new(config);
        let (a, a_manager) = connection_to(peer_addr(), config.clone(), registry_a);
        let (b, b_manager) = connection_to(self_addr(), config, registry_b);
        ConnectionPair { a, a_manager, b, b_manager }
    }

    /// exchanges handshake messages over a lossless channel until both are acknowledged
    pub fn handshake(&self) {
        self.a.send_reliable(HANDSHAKE, b"hello").unwrap();
        self.b.send_reliable(HANDSHAKE, b"hello").unwrap();

        for _ in 0..10 {
            self.round(&mut lossless(), &mut lossless());
            if self.a.stats().unconfirmed_frames == 0 && self.b.stats().unconfirmed_frames == 0 {
                self.a.complete_handshake();
                self.b.complete_handshake();
                return;
            }
        }
        panic!("handshake frames were not acknowledged");
    }

    /// one heartbeat round on both sides, and delivery of what arrives in this round
    pub fn round(&self, a_to_b: &mut LossyChannel, b_to_a: &mut LossyChannel) {
        self.a.tick();
        self.b.tick();

        for datagram in a_to_b.transmit(self.a_manager.take_sent()) {
            self.b.receive(&datagram);
        }
        for datagram in b_to_a.transmit(self.b_manager.take_sent()) {
            self.a.receive(&datagram);
        }
    }
}
