use clap::Parser;
use clap_derive::Parser;
use datagram_link::config::TransportConfig;
use datagram_link::connection::{Connection, ConnectionOrigin};
use datagram_link::end_point::{ConnectionListener, EndPoint};
use datagram_link::message_type::MessageType;
use datagram_link::registry::{MessageHandler, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{error, info, warn, Level};

const HANDSHAKE: MessageType = MessageType::new(1);
const CHAT: MessageType = MessageType::new(10);
const PRESENCE: MessageType = MessageType::new(11);

#[derive(Parser)]
struct Args {
    /// the address to bind to
    self_address: String,

    /// peers to connect to, as `host[:port][?]`
    #[clap(long)]
    peer: Vec<String>,

    #[clap(long, default_value = "anonymous")]
    name: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

/// Both sides send their name. The side that accepted the connection answers the first
///  handshake message with its own.
struct HandshakeHandler {
    name: String,
}
impl MessageHandler for HandshakeHandler {
    fn on_message(&self, connection: &Connection, payload: &[u8]) {
        if connection.is_handshake_complete() {
            return;
        }
        info!("{:?} is {}", connection.peer_addr(), String::from_utf8_lossy(payload));
        connection.complete_handshake();

        if connection.origin() == ConnectionOrigin::Incoming {
            if let Err(e) = connection.send_reliable(HANDSHAKE, self.name.as_bytes()) {
                error!("error answering handshake: {}", e);
            }
        }
    }
}

struct ChatHandler;
impl MessageHandler for ChatHandler {
    fn on_message(&self, connection: &Connection, payload: &[u8]) {
        println!("{:?}: {}", connection.peer_addr(), String::from_utf8_lossy(payload));
    }
}

struct PresenceHandler;
impl MessageHandler for PresenceHandler {
    fn on_message(&self, connection: &Connection, payload: &[u8]) {
        let stats = connection.stats();
        info!("presence from {:?} ({} bytes), loss ratio {:.2}", connection.peer_addr(), payload.len(), stats.loss_ratio());
    }
}

struct LoggingListener;
#[async_trait]
impl ConnectionListener for LoggingListener {
    async fn on_connected(&self, connection: Arc<Connection>) {
        info!("new connection from {:?}", connection.peer_addr());
    }

    async fn on_disconnected(&self, peer: SocketAddr) {
        info!("{:?} disconnected", peer);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut registry = Registry::new();
    registry.register(HANDSHAKE, Arc::new(HandshakeHandler { name: args.name.clone() }))?;
    registry.register(CHAT, Arc::new(ChatHandler))?;
    registry.register(PRESENCE, Arc::new(PresenceHandler))?;

    let config = TransportConfig::default_ipv4(args.self_address.parse()?);
    let end_point = EndPoint::new(Arc::new(config), Arc::new(registry), Arc::new(LoggingListener)).await?;

    for peer in &args.peer {
        let connection = end_point.connect(peer).await?;
        connection.send_reliable(HANDSHAKE, args.name.as_bytes())?;
    }

    select! {
        _ = end_point.run() => Ok(()),
        result = chat(&end_point) => result,
        _ = presence(&end_point) => Ok(()),
    }
}

/// sends every line from stdin to all peers
async fn chat(end_point: &EndPoint) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        for connection in end_point.connections() {
            if !connection.is_active() {
                continue;
            }
            if let Err(e) = connection.send_reliable(CHAT, line.as_bytes()) {
                warn!("error sending to {:?}: {}", connection.peer_addr(), e);
            }
        }
    }
    info!("end of input - disconnecting");
    for connection in end_point.connections() {
        connection.disconnect();
    }
    Ok(())
}

/// a high-frequency state update that is worthless once superseded
async fn presence(end_point: &EndPoint) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
    let mut counter = 0u64;
    loop {
        interval.tick().await;
        counter += 1;
        for connection in end_point.connections() {
            if connection.is_active() {
                connection.send_unreliable(PRESENCE, &counter.to_be_bytes()).ok();
            }
        }
    }
}
