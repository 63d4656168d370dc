//! # Kestrel DHT
//!
//! Core of a Kademlia-style DHT node. Key pieces:
//!
//! - 160-bit node identifiers with the XOR distance metric
//! - K-bucket routing table (k=20) with deferred insertion: full buckets
//!   probe their least-recently-seen peer before evicting anyone
//! - Request supervisor correlating responses to requests by token and
//!   firing timeout recovery exactly once per request
//! - Iterative FIND_NODE lookup with alpha parallelism (default 3)
//! - Listener and maintenance loops keeping the table fresh under churn
//!
//! The node speaks four wire messages (PING, PONG, FIND_NODE, NODES) over
//! any [`kestrel_transport::Transport`]; peers are identified by their
//! self-declared id.
//!
//! # Example
//!
//! ```no_run
//! use kestrel_dht::{DhtConfig, DhtNode, PeerInfo};
//! use kestrel_transport::udp::UdpTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(UdpTransport::bind("0.0.0.0:8470".parse::<std::net::SocketAddr>()?).await?);
//!
//! let mut config = DhtConfig::default();
//! config.add_bootstrap_peer(PeerInfo {
//!     id: kestrel_dht::NodeId::from_bytes([7u8; 20]),
//!     addr: "198.51.100.1:8470".parse()?,
//! });
//!
//! let node = DhtNode::new(config, transport)?;
//! node.start().await?;
//!
//! let neighbors = node.lookup(*node.local_id()).await?;
//! println!("found {} neighbors", neighbors.len());
//!
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod messages;
pub mod node;
pub mod node_id;
pub mod routing;
pub mod supervisor;

mod handlers;
mod lookup;

// Re-exports for convenience
pub use config::{ConfigError, DhtConfig, MaintenanceHook};
pub use messages::{Message, MessageError, PeerInfo, Token};
pub use node::{DhtNode, NodeError, NodeStats};
pub use node_id::{Distance, NodeId};
pub use routing::{DEFAULT_K, NUM_BUCKETS, ObserveOutcome, Peer, ProbeTarget, RoutingTable};
pub use supervisor::{RequestSupervisor, ResponseCallback, SupervisorError, TimeoutCallback};
