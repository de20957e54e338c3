//! Node connection abstraction for the multiplexer
//!
//! A node connection is one long-lived, reliable, message-oriented channel
//! between two peer nodes. The multiplexer only needs three things from it:
//! an outbound queue that blocks when saturated, an inbound queue that ends
//! when the peer goes away, and a bound on message size. This crate defines
//! those contracts as traits so the multiplexer does not depend on any
//! particular substrate.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 nodemux-tunnel (Transport)              │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │              nodemux-node (this crate)                  │
//! │  - NodeConnection    - NodeConnector    - NodeListener  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌───────────────────────────┬─────────────────────────────┐
//! │ ChannelConnection         │ TcpNodeConnector /          │
//! │ (in-memory pair, queues)  │ TcpNodeListener             │
//! └───────────────────────────┴─────────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod channel;
pub mod tcp;

pub use channel::ChannelConnection;
pub use tcp::{TcpNodeConnector, TcpNodeListener};

/// Default maximum size of one node message (16KB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Default depth of the inbound and outbound message queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Node connection errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),

    #[error("Timeout")]
    Timeout,
}

/// Result type for node connection operations
pub type NodeResult<T> = Result<T, NodeError>;

/// A reliable message channel to one peer node
///
/// Message boundaries are preserved: every `send` on one side is delivered
/// as exactly one `recv` on the other, in submission order.
#[async_trait]
pub trait NodeConnection: Send + Sync + Debug {
    /// Submit a message to the outbound queue
    ///
    /// Blocks while the queue is saturated.
    async fn send(&self, message: Bytes) -> NodeResult<()>;

    /// Receive the next inbound message
    ///
    /// Returns `None` once the connection is closed and every buffered
    /// message has been delivered.
    async fn recv(&self) -> NodeResult<Option<Bytes>>;

    /// Close the connection. Blocked senders and receivers are released.
    async fn close(&self);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Largest message `send` accepts
    fn max_message_size(&self) -> usize;

    /// Get a unique stable identifier for this connection
    fn connection_id(&self) -> String;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats {
        ConnectionStats::default()
    }
}

/// Establishes outgoing node connections
///
/// A connector may hold shared resources (sockets, endpoints, worker tasks)
/// that are released by [`NodeConnector::close`].
#[async_trait]
pub trait NodeConnector: Send + Sync + Debug {
    /// Connect to a remote node
    async fn connect(&self, address: &str) -> NodeResult<Arc<dyn NodeConnection>>;

    /// Release connector resources. Connections already handed out stay open.
    async fn close(&self) {}
}

/// Accepts incoming node connections
#[async_trait]
pub trait NodeListener: Send + Sync + Debug {
    /// Accept an incoming connection
    ///
    /// Returns the connection and the remote address of the connecting peer.
    async fn accept(&self) -> NodeResult<(Arc<dyn NodeConnection>, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> NodeResult<SocketAddr>;
}

/// Statistics about a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Number of messages submitted
    pub messages_sent: u64,

    /// Number of messages delivered
    pub messages_received: u64,

    /// Number of payload bytes submitted
    pub bytes_sent: u64,

    /// Number of payload bytes delivered
    pub bytes_received: u64,
}

/// Node connection tuning
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Depth of each message queue before senders block
    pub queue_capacity: usize,

    /// Largest message accepted on the connection
    pub max_message_size: usize,

    /// Time allowed for establishing an outgoing connection
    pub connect_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}
