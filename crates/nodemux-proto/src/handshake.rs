//! Route handshake sent by the dialing peer
//!
//! After a node connection is established by `Connect`, the dialer sends one
//! TRANSPORT frame on [`HANDSHAKE_STREAM_ID`](crate::HANDSHAKE_STREAM_ID)
//! whose payload is a bincode-encoded [`AppRoute`]. It names the two nodes and
//! the two applications the tunnel joins so the remote side can route by
//! application identity.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::mux::Frame;
use crate::HANDSHAKE_STREAM_ID;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// 32-byte node or application identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PubKey([u8; 32]);

impl PubKey {
    pub const ZERO: PubKey = PubKey([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PubKey {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| HandshakeError::InvalidKey(format!("{}: {}", s, e)))?;
        Ok(Self(bytes))
    }
}

/// The four identities a tunnel connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppRoute {
    pub from_node: PubKey,
    pub to_node: PubKey,
    pub from_app: PubKey,
    pub to_app: PubKey,
}

impl AppRoute {
    pub fn new(from_node: PubKey, to_node: PubKey, from_app: PubKey, to_app: PubKey) -> Self {
        Self {
            from_node,
            to_node,
            from_app,
            to_app,
        }
    }

    /// The same route as seen from the other end
    pub fn reversed(&self) -> Self {
        Self {
            from_node: self.to_node,
            to_node: self.from_node,
            from_app: self.to_app,
            to_app: self.from_app,
        }
    }

    pub fn encode(&self) -> Result<Bytes, HandshakeError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, HandshakeError> {
        Ok(bincode::deserialize(payload)?)
    }

    /// Wrap the encoded route in its handshake frame
    pub fn to_frame(&self) -> Result<Frame, HandshakeError> {
        Ok(Frame::transport(HANDSHAKE_STREAM_ID, self.encode()?))
    }
}
