//! Node Multiplexer Protocol Definitions
//!
//! Wire types shared by both peers of a node connection: the 5-byte frame
//! header that tags every message with an operation and a stream id, and the
//! route handshake sent once when a dialing peer establishes the connection.

pub mod handshake;
pub mod mux;

pub use handshake::{AppRoute, HandshakeError, PubKey};
pub use mux::{Frame, FrameError, FrameHeader, OpCode, StreamId};

/// Frame header size: op code (1) + stream id (4)
pub const HEADER_SIZE: usize = 5;

/// Reserved stream ID carrying the route handshake
pub const HANDSHAKE_STREAM_ID: StreamId = 0;
