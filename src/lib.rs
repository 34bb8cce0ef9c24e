//! Mini-Node: the P2P networking core of a Bitcoin-style full node
//!
//! This crate provides the connection-level machinery of a node:
//! - Binary wire codec with a fixed 24-byte header, double-SHA-256
//!   checksums and canonical compact sizes
//! - Static message catalog driving structural validation of every
//!   inbound payload before any business logic sees it
//! - Cancellable task groups and dedicated worker threads
//! - A connection hub with admission control, handshake management,
//!   flood protection and keepalive maintenance
//!
//! # Example
//!
//! ```rust,no_run
//! use mini_node::network::{ConnectionHub, ConnectionType, HubConfig, HubEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mini_node::network::NetError> {
//!     let config = HubConfig {
//!         listen_addr: "0.0.0.0:8333".parse().unwrap(),
//!         ..HubConfig::default()
//!     };
//!     let (mut hub, mut events) = ConnectionHub::new(config);
//!     hub.bind().await?;
//!     hub.connect_to("203.0.113.7:8333".parse().unwrap(), ConnectionType::ManualOutbound);
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             if let HubEvent::SessionEstablished { addr, .. } = event {
//!                 println!("connected to {addr}");
//!             }
//!         }
//!     });
//!     hub.run().await
//! }
//! ```

pub mod codec;
pub mod crypto;
pub mod network;
pub mod task;

pub use codec::{Message, MessageKind, RejectReason};
pub use network::{ConnectionHub, HubConfig, HubEvent, NetError};
