//! Application listener accept loop

use nodemux_node::NodeConnection;
use nodemux_proto::{StreamId, HANDSHAKE_STREAM_ID};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_conn::AppConnection;
use crate::config::TunnelConfig;
use crate::forward::AppReadLoop;
use crate::registry::StreamRegistry;

/// Allocates stream ids for locally accepted connections
///
/// Starts at 1 and wraps around, never handing out the handshake id.
#[derive(Debug)]
pub struct StreamIdGenerator {
    next_stream_id: AtomicU32,
}

impl StreamIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(first: StreamId) -> Self {
        Self {
            next_stream_id: AtomicU32::new(first),
        }
    }

    pub fn generate(&self) -> StreamId {
        loop {
            let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
            if id != HANDSHAKE_STREAM_ID {
                return id;
            }
        }
    }
}

impl Default for StreamIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Acceptor {
    pub listener: TcpListener,
    pub node: Arc<dyn NodeConnection>,
    pub registry: Arc<StreamRegistry>,
    pub config: TunnelConfig,
    pub shutdown: CancellationToken,
}

impl Acceptor {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let ids = StreamIdGenerator::new();
        let local_addr = self.listener.local_addr().ok();
        info!(address = ?local_addr, "Accepting application connections");

        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Application listener stopped");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Application listener failed: {}", e);
                        break;
                    }
                },
            };

            let stream_id = ids.generate();
            let _ = socket.set_nodelay(true);
            let (conn, reader) = AppConnection::split(socket, peer_addr.to_string());

            if !self.registry.insert(stream_id, conn.clone()) {
                debug!(stream_id, "Transport closing, rejecting application connection");
                conn.close();
                continue;
            }
            debug!(stream_id, peer = %peer_addr, "Accepted application connection");

            AppReadLoop {
                stream_id,
                conn,
                reader,
                node: self.node.clone(),
                registry: self.registry.clone(),
                config: self.config.clone(),
                announce: true,
            }
            .spawn();
        }
    }
}
