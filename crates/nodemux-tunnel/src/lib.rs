//! Stream multiplexing over a node connection
//!
//! Carries many independent application TCP connections over one
//! message-oriented node connection. Every node message is one frame: a
//! 5-byte header naming the operation and stream id, followed by payload.
//!
//! Two kinds of tasks move bytes:
//!
//! - one node read loop per node connection, which decodes frames and hands
//!   their payload to the matching application connection, dialing the
//!   configured application address for ids it has not seen before (on the
//!   dialing side only)
//! - one app read loop per application connection, which frames whatever the
//!   application writes and queues it on the node connection
//!
//! Both sides share a [`StreamRegistry`]. The side that allocated a stream id
//! is the one that finally frees it, so a close racing in from both
//! directions never resurrects or double-frees an id.
//!
//! # Example
//!
//! ```ignore
//! use nodemux_node::TcpNodeConnector;
//! use nodemux_proto::AppRoute;
//! use nodemux_tunnel::{Transport, TunnelConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Transport::new(
//!     Arc::new(TcpNodeConnector::default()),
//!     AppRoute::default(),
//!     TunnelConfig::default(),
//! );
//! transport.connect("relay.example.com:7000", "127.0.0.1:8080").await?;
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod app_conn;
pub mod config;
mod demux;
pub mod error;
mod forward;
pub mod registry;
pub mod transport;

pub use acceptor::StreamIdGenerator;
pub use app_conn::{AppConnection, AppReadHalf};
pub use config::TunnelConfig;
pub use error::{TunnelError, TunnelResult};
pub use registry::{Origin, StreamRegistry, StreamState};
pub use transport::Transport;
