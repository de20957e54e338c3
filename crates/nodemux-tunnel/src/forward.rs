//! App read loop: application bytes → node connection

use bytes::BytesMut;
use nodemux_node::NodeConnection;
use nodemux_proto::{Frame, StreamId};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::app_conn::{AppConnection, AppReadHalf};
use crate::config::TunnelConfig;
use crate::registry::StreamRegistry;

/// One application connection's outbound half
pub(crate) struct AppReadLoop {
    pub stream_id: StreamId,
    pub conn: Arc<AppConnection>,
    pub reader: AppReadHalf,
    pub node: Arc<dyn NodeConnection>,
    pub registry: Arc<StreamRegistry>,
    pub config: TunnelConfig,
    /// Set for streams accepted locally; announces the id before any data
    pub announce: bool,
}

impl AppReadLoop {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    /// Forward reads as TRANSPORT frames until EOF, error or close, then
    /// tear the stream down
    pub async fn run(self) {
        let AppReadLoop {
            stream_id,
            conn,
            mut reader,
            node,
            registry,
            config,
            announce,
        } = self;

        if announce {
            if let Err(e) = node.send(Frame::announce(stream_id).encode()).await {
                debug!(stream_id, "Failed to announce stream: {}", e);
                teardown(stream_id, &conn, node.as_ref(), &registry).await;
                return;
            }
        }

        let mut buffer = BytesMut::zeroed(config.read_buffer_size(node.max_message_size()));
        let mut forwarded = 0u64;

        loop {
            let read = tokio::select! {
                _ = conn.closed() => break,
                read = reader.read(&mut buffer) => read,
            };

            let n = match read {
                Ok(0) => {
                    debug!(stream_id, "App connection reached EOF");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(stream_id, "App connection read error: {}", e);
                    break;
                }
            };

            trace!(stream_id, bytes = n, "App → node");
            if let Err(e) = node
                .send(Frame::encode_transport(stream_id, &buffer[..n]))
                .await
            {
                debug!(stream_id, "Node send failed: {}", e);
                break;
            }
            forwarded += n as u64;
        }

        debug!(stream_id, bytes = forwarded, label = conn.label(), "App read loop finished");
        teardown(stream_id, &conn, node.as_ref(), &registry).await;
    }
}

async fn teardown(
    stream_id: StreamId,
    conn: &Arc<AppConnection>,
    node: &dyn NodeConnection,
    registry: &StreamRegistry,
) {
    if registry.finish_local(stream_id, conn).sends_close() {
        // Node connection may already be gone
        let _ = node.send(Frame::close(stream_id).encode()).await;
    }
    conn.close();
    conn.shutdown_write().await;
}
