use nodemux_node::NodeError;
use nodemux_proto::HandshakeError;
use thiserror::Error;

/// Transport lifecycle errors
///
/// Only establishment and setup failures surface here. Per-frame and
/// per-stream failures are logged by the read loops and never returned.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Node connection error: {0}")]
    Node(#[from] NodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Failed to bind application listener on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Node message limit of {limit} bytes is below the {min} bytes a frame needs")]
    MessageLimitTooSmall { limit: usize, min: usize },

    #[error("Node connection already established")]
    AlreadyEstablished,

    #[error("Node connection not established")]
    NotEstablished,

    #[error("Application listener already running")]
    AlreadyListening,

    #[error("Transport closed")]
    Closed,
}

pub type TunnelResult<T> = std::result::Result<T, TunnelError>;
