//! Node read loop: node connection frames → application connections

use bytes::Bytes;
use nodemux_node::NodeConnection;
use nodemux_proto::{AppRoute, Frame, OpCode, StreamId, HANDSHAKE_STREAM_ID};
use std::io;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::app_conn::AppConnection;
use crate::config::TunnelConfig;
use crate::forward::AppReadLoop;
use crate::registry::{DialProgress, DialTicket, PeerClose, Route, StreamRegistry};

/// How the node read loop finds the application connection for a stream id
#[derive(Debug, Clone)]
pub(crate) enum Resolver {
    /// Dial `app_address` the first time a peer-assigned id shows up
    Dial(String),
    /// Only route to connections already registered by the acceptor
    Lookup,
}

/// Demultiplexer for one node connection
///
/// Frames are handled one at a time in arrival order, which keeps every
/// stream's bytes in order. Application dials run in their own tasks so a
/// slow dial only holds up its own stream.
pub(crate) struct NodeReadLoop {
    pub node: Arc<dyn NodeConnection>,
    pub registry: Arc<StreamRegistry>,
    pub resolver: Resolver,
    pub config: TunnelConfig,
    pub peer_route: Arc<OnceLock<AppRoute>>,
}

impl NodeReadLoop {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    pub async fn run(self) {
        let connection_id = self.node.connection_id();
        debug!(connection = %connection_id, "Node read loop started");

        loop {
            let message = match self.node.recv().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(connection = %connection_id, "Node connection closed");
                    break;
                }
                Err(e) => {
                    debug!(connection = %connection_id, "Node receive error: {}", e);
                    break;
                }
            };

            let frame = match Frame::decode(message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(connection = %connection_id, "Dropping frame: {}", e);
                    continue;
                }
            };

            self.process_frame(frame).await;
        }

        debug!(connection = %connection_id, "Node read loop finished");
    }

    async fn process_frame(&self, frame: Frame) {
        if frame.stream_id == HANDSHAKE_STREAM_ID {
            if frame.op == OpCode::Transport && !frame.payload.is_empty() {
                self.handle_handshake(&frame.payload);
            }
            return;
        }

        match frame.op {
            OpCode::Close => self.handle_close(frame.stream_id),
            OpCode::Shutdown => {
                debug!(stream_id = frame.stream_id, "Ignoring SHUTDOWN frame");
            }
            OpCode::Transport => self.handle_transport(frame.stream_id, frame.payload).await,
        }
    }

    fn handle_handshake(&self, payload: &[u8]) {
        match AppRoute::decode(payload) {
            Ok(route) => {
                info!(
                    from_node = %route.from_node,
                    from_app = %route.from_app,
                    to_app = %route.to_app,
                    "Peer handshake received"
                );
                if self.peer_route.set(route).is_err() {
                    warn!("Ignoring repeated handshake");
                }
            }
            Err(e) => warn!("Invalid handshake payload: {}", e),
        }
    }

    fn handle_close(&self, stream_id: StreamId) {
        match self.registry.close_from_peer(stream_id) {
            PeerClose::Closed(conn) => {
                debug!(stream_id, "Stream closed by peer");
                conn.close();
            }
            PeerClose::Finalized => trace!(stream_id, "Close acknowledged by peer"),
            PeerClose::Ignored => trace!(stream_id, "CLOSE for unknown stream"),
        }
    }

    async fn handle_transport(&self, stream_id: StreamId, payload: Bytes) {
        let route = match &self.resolver {
            Resolver::Lookup => match self.registry.lookup(stream_id) {
                Some(conn) => Route::Deliver(conn, payload),
                None => Route::Drop,
            },
            Resolver::Dial(app_address) => {
                let route = self.registry.get_or_dial(stream_id, payload);
                if let Route::Dial(ticket) = route {
                    DialTask {
                        stream_id,
                        ticket,
                        app_address: app_address.clone(),
                        node: self.node.clone(),
                        registry: self.registry.clone(),
                        config: self.config.clone(),
                    }
                    .spawn();
                }
                route
            }
        };

        let (conn, payload) = match route {
            Route::Deliver(conn, payload) => (conn, payload),
            Route::Parked | Route::Dial(_) => {
                trace!(stream_id, "Payload parked behind pending dial");
                return;
            }
            Route::Drop => {
                trace!(stream_id, "Dropping frame for unavailable stream");
                return;
            }
        };

        // Announcement frames only open the stream
        if payload.is_empty() {
            return;
        }

        trace!(stream_id, bytes = payload.len(), "Node → app");
        if let Err(e) = conn.write_all(&payload).await {
            debug!(stream_id, "App connection write failed: {}", e);
            conn.close();
        }
    }
}

/// Dials the application for a stream the peer opened, then becomes that
/// stream's app read loop
struct DialTask {
    stream_id: StreamId,
    ticket: DialTicket,
    app_address: String,
    node: Arc<dyn NodeConnection>,
    registry: Arc<StreamRegistry>,
    config: TunnelConfig,
}

impl DialTask {
    fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let stream_id = self.stream_id;
        let stream = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                let dropped = self.registry.abandon_dial(stream_id, self.ticket);
                debug!(stream_id, app = %self.app_address, dropped, "App connection dial failed: {}", e);
                return;
            }
        };
        debug!(stream_id, app = %self.app_address, "Dialed application for new stream");

        let label = format!("{}#{}", self.app_address, stream_id);
        let (conn, reader) = AppConnection::split(stream, label);

        loop {
            match self.registry.settle_dial(stream_id, self.ticket, &conn) {
                DialProgress::Flush(parked) => {
                    for payload in parked {
                        if let Err(e) = conn.write_all(&payload).await {
                            debug!(stream_id, "App connection write failed: {}", e);
                            conn.close();
                            break;
                        }
                    }
                }
                DialProgress::Ready { overflowed } => {
                    if overflowed {
                        warn!(stream_id, "Dial backlog exceeded, closing stream");
                        conn.close();
                    }
                    break;
                }
                DialProgress::Abandoned => {
                    debug!(stream_id, "Discarding dial result, stream went away");
                    conn.close();
                    return;
                }
            }
        }

        AppReadLoop {
            stream_id,
            conn,
            reader,
            node: self.node,
            registry: self.registry,
            config: self.config,
            announce: false,
        }
        .run()
        .await;
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(&self.app_address),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "app dial timed out"))??;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}
