//! Framing primitives for the node multiplexer

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::HEADER_SIZE;

/// Stream identifier
pub type StreamId = u32;

/// Operation carried in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OpCode {
    /// Payload-carrying frame. An empty payload announces the stream.
    #[default]
    Transport = 0,
    /// The sender has torn down its end of the stream
    Close = 1,
    /// Reserved
    Shutdown = 2,
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OpCode::Transport),
            1 => Ok(OpCode::Close),
            2 => Ok(OpCode::Shutdown),
            _ => Err(FrameError::InvalidOpCode(value)),
        }
    }
}

/// Framing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: {0} bytes (header needs 5)")]
    MalformedFrame(usize),

    #[error("Invalid op code: {0}")]
    InvalidOpCode(u8),
}

/// The fixed 5-byte header prefixed to every node message
///
/// Wire format:
/// ```text
/// [op: u8][stream_id: u32 big-endian]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: OpCode,
    pub stream_id: StreamId,
}

impl FrameHeader {
    pub fn new(op: OpCode, stream_id: StreamId) -> Self {
        Self { op, stream_id }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = self.op as u8;
        header[1..].copy_from_slice(&self.stream_id.to_be_bytes());
        header
    }

    /// Decode the header at the start of `buf`. Trailing bytes are ignored.
    pub fn decode(mut buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::MalformedFrame(buf.len()));
        }

        let op = OpCode::try_from(buf.get_u8())?;
        let stream_id = buf.get_u32();

        Ok(Self { op, stream_id })
    }
}

/// One header-plus-payload unit exchanged on the node connection
///
/// There is no length prefix: the payload runs to the end of the message,
/// whose boundary the node connection preserves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub op: OpCode,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(op: OpCode, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            op,
            stream_id,
            payload,
        }
    }

    pub fn transport(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(OpCode::Transport, stream_id, payload)
    }

    /// Empty TRANSPORT frame that lets the peer learn a stream id before data
    pub fn announce(stream_id: StreamId) -> Self {
        Self::new(OpCode::Transport, stream_id, Bytes::new())
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(OpCode::Close, stream_id, Bytes::new())
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(self.op, self.stream_id)
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode frame from one node message
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        let header = FrameHeader::decode(&buf)?;
        buf.advance(HEADER_SIZE);

        Ok(Self {
            op: header.op,
            stream_id: header.stream_id,
            payload: buf,
        })
    }

    /// Encode a TRANSPORT frame straight from a borrowed read buffer
    pub fn encode_transport(stream_id: StreamId, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_slice(&FrameHeader::new(OpCode::Transport, stream_id).encode());
        buf.put_slice(payload);
        buf.freeze()
    }
}
