//! Hub-facing configuration
//!
//! Consumed, never produced, by the networking core; the surrounding node
//! decides the values.

use crate::codec::{ServiceFlags, MAGIC};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a [`crate::network::ConnectionHub`]
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Local listen endpoint
    pub listen_addr: SocketAddr,
    /// Network magic stamped on and expected in every header
    pub magic: [u8; 4],
    /// Refuse IPv6 peers entirely
    pub ipv4_only: bool,
    /// Global cap on live sessions
    pub max_connections: usize,
    /// Cap on live sessions per remote IP
    pub max_connections_per_ip: usize,
    /// How long a connection may sit in the version/verack exchange
    pub handshake_timeout: Duration,
    /// Established sessions quiet longer than this are disconnected
    pub idle_timeout: Duration,
    /// How long a sent ping may go unanswered
    pub ping_timeout: Duration,
    /// Cadence of the maintenance cycle
    pub maintenance_interval: Duration,
    /// Capacity of the outbound connect queue
    pub connect_queue_capacity: usize,
    /// Manually-configured outbound endpoints, attempted at startup
    pub manual_peers: Vec<SocketAddr>,
    /// Local nonce advertised in `version`, used to detect self-connection
    pub nonce: u64,
    /// User agent advertised in `version`
    pub user_agent: String,
    /// Best-height hint advertised in `version`
    pub start_height: i32,
    /// Service bits advertised in `version`
    pub services: ServiceFlags,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8333".parse().expect("static addr"),
            magic: MAGIC,
            ipv4_only: false,
            max_connections: 125,
            max_connections_per_ip: 3,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(20 * 60),
            ping_timeout: Duration::from_secs(2 * 60),
            maintenance_interval: Duration::from_secs(10),
            connect_queue_capacity: 64,
            manual_peers: Vec::new(),
            nonce: rand::random(),
            user_agent: format!("/mini-node:{}/", env!("CARGO_PKG_VERSION")),
            start_height: 0,
            services: ServiceFlags::NODE_NETWORK,
        }
    }
}
