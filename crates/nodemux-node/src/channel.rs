//! Queue-backed node connection
//!
//! [`ChannelConnection`] is the shape every concrete transport reduces to:
//! a bounded outbound queue drained by whatever carries messages to the
//! peer, a bounded inbound queue filled by whatever receives them, and a
//! cancellation token standing for the link. Cancelling the token is a
//! disconnect: senders fail, and receivers drain what is already queued
//! before observing the end of the stream.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{ConnectionStats, NodeConfig, NodeConnection, NodeError, NodeResult};

/// Node connection over a pair of bounded message queues
pub struct ChannelConnection {
    connection_id: String,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    link: CancellationToken,
    max_message_size: usize,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ChannelConnection {
    /// Build a connection from its queue ends
    ///
    /// `outbound` feeds the peer, `inbound` yields what the peer sent, and
    /// `link` is cancelled when either side disconnects.
    pub fn new(
        connection_id: impl Into<String>,
        outbound: mpsc::Sender<Bytes>,
        inbound: mpsc::Receiver<Bytes>,
        link: CancellationToken,
        max_message_size: usize,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            outbound,
            inbound: Mutex::new(inbound),
            link,
            max_message_size,
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Create two connected in-memory ends
    ///
    /// Closing either end disconnects both.
    pub fn pair(config: &NodeConfig) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(config.queue_capacity);
        let (b_tx, a_rx) = mpsc::channel(config.queue_capacity);
        let link = CancellationToken::new();

        let a = Self::new("mem-a", a_tx, a_rx, link.clone(), config.max_message_size);
        let b = Self::new("mem-b", b_tx, b_rx, link, config.max_message_size);
        (a, b)
    }
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.link.is_cancelled())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

#[async_trait]
impl NodeConnection for ChannelConnection {
    async fn send(&self, message: Bytes) -> NodeResult<()> {
        if self.link.is_cancelled() {
            return Err(NodeError::ConnectionClosed);
        }
        if message.len() > self.max_message_size {
            return Err(NodeError::MessageTooLarge(
                message.len(),
                self.max_message_size,
            ));
        }

        let len = message.len() as u64;
        tokio::select! {
            biased;
            _ = self.link.cancelled() => Err(NodeError::ConnectionClosed),
            result = self.outbound.send(message) => {
                result.map_err(|_| NodeError::ConnectionClosed)?;
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(len, Ordering::Relaxed);
                trace!("{}: queued {} bytes", self.connection_id, len);
                Ok(())
            }
        }
    }

    async fn recv(&self) -> NodeResult<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;

        let message = tokio::select! {
            biased;
            message = inbound.recv() => message,
            _ = self.link.cancelled() => {
                // Deliver anything that was queued before the disconnect
                inbound.try_recv().ok()
            }
        };

        if let Some(message) = &message {
            self.messages_received.fetch_add(1, Ordering::Relaxed);
            self.bytes_received
                .fetch_add(message.len() as u64, Ordering::Relaxed);
        }
        Ok(message)
    }

    async fn close(&self) {
        if !self.link.is_cancelled() {
            debug!("Closing node connection {}", self.connection_id);
            self.link.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.link.is_cancelled()
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}
