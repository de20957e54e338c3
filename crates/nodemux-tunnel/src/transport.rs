//! Transport: one node connection, many application streams

use nodemux_node::{NodeConnection, NodeConnector};
use nodemux_proto::{AppRoute, StreamId};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::acceptor::Acceptor;
use crate::config::{TunnelConfig, MIN_MESSAGE_SIZE};
use crate::demux::{NodeReadLoop, Resolver};
use crate::error::{TunnelError, TunnelResult};
use crate::registry::{StreamRegistry, StreamState};

struct AppListener {
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

/// Structural state, changed only by establishment, `listen_for_app` and
/// `close`
struct Fields {
    /// `None` once the transport has been closed
    connector: Option<Arc<dyn NodeConnector>>,
    node: Option<Arc<dyn NodeConnection>>,
    app_listener: Option<AppListener>,
}

/// Multiplexes application TCP connections over a single node connection
///
/// A transport establishes its node connection once, either by dialing
/// ([`connect`](Self::connect), [`listen_and_connect`](Self::listen_and_connect))
/// or by taking over an accepted one ([`adopt`](Self::adopt)). Read loops are
/// spawned as tasks and run until their connection fails or the transport
/// is closed; [`close`](Self::close) never waits for them.
pub struct Transport {
    route: AppRoute,
    config: TunnelConfig,
    registry: Arc<StreamRegistry>,
    peer_route: Arc<OnceLock<AppRoute>>,
    fields: Mutex<Fields>,
}

impl Transport {
    pub fn new(connector: Arc<dyn NodeConnector>, route: AppRoute, config: TunnelConfig) -> Self {
        Self {
            route,
            registry: Arc::new(StreamRegistry::with_dial_backlog(config.dial_backlog_bytes)),
            peer_route: Arc::new(OnceLock::new()),
            config,
            fields: Mutex::new(Fields {
                connector: Some(connector),
                node: None,
                app_listener: None,
            }),
        }
    }

    /// Dial the remote node, send the route handshake, and dial
    /// `app_address` for every new stream the peer opens
    pub async fn connect(&self, node_address: &str, app_address: &str) -> TunnelResult<()> {
        let handshake = self.route.to_frame()?.encode();
        let connector = self.connector_for_establishment().await?;

        info!(node = %node_address, app = %app_address, "Connecting to node");
        let node = connector.connect(node_address).await?;

        if let Err(e) = node.send(handshake).await {
            node.close().await;
            return Err(e.into());
        }
        debug!(connection = %node.connection_id(), "Handshake sent");

        self.establish(node, Resolver::Dial(app_address.to_string()))
            .await
    }

    /// Dial the remote node without a handshake
    ///
    /// Used by a forwarding relay: frames are routed only to streams this
    /// side accepted, unknown ids are never dialed.
    pub async fn listen_and_connect(
        &self,
        address: &str,
    ) -> TunnelResult<Arc<dyn NodeConnection>> {
        let connector = self.connector_for_establishment().await?;

        info!(node = %address, "Connecting to node");
        let node = connector.connect(address).await?;

        self.establish(node.clone(), Resolver::Lookup).await?;
        Ok(node)
    }

    /// Establish over a node connection accepted elsewhere
    pub async fn adopt(&self, node: Arc<dyn NodeConnection>) -> TunnelResult<()> {
        info!(connection = %node.connection_id(), "Adopting node connection");
        self.establish(node, Resolver::Lookup).await
    }

    async fn connector_for_establishment(&self) -> TunnelResult<Arc<dyn NodeConnector>> {
        let fields = self.fields.lock().await;
        let connector = fields.connector.clone().ok_or(TunnelError::Closed)?;
        if fields.node.is_some() {
            return Err(TunnelError::AlreadyEstablished);
        }
        Ok(connector)
    }

    async fn establish(
        &self,
        node: Arc<dyn NodeConnection>,
        resolver: Resolver,
    ) -> TunnelResult<()> {
        let mut fields = self.fields.lock().await;

        // State may have changed while dialing
        let limit = node.max_message_size();
        let rejected = if fields.connector.is_none() {
            Some(TunnelError::Closed)
        } else if fields.node.is_some() {
            Some(TunnelError::AlreadyEstablished)
        } else if limit < MIN_MESSAGE_SIZE {
            Some(TunnelError::MessageLimitTooSmall {
                limit,
                min: MIN_MESSAGE_SIZE,
            })
        } else {
            None
        };
        if let Some(e) = rejected {
            drop(fields);
            node.close().await;
            return Err(e);
        }

        fields.node = Some(node.clone());
        NodeReadLoop {
            node,
            registry: self.registry.clone(),
            resolver,
            config: self.config.clone(),
            peer_route: self.peer_route.clone(),
        }
        .spawn();

        info!("Node connection established");
        Ok(())
    }

    /// Accept application connections on `address` and tunnel each one as a
    /// new stream
    ///
    /// `on_ready` runs once the listener is bound, before the first accept.
    /// Returns the bound address.
    pub async fn listen_for_app<F>(&self, address: &str, on_ready: F) -> TunnelResult<SocketAddr>
    where
        F: FnOnce(),
    {
        let (listener, node, shutdown, local_addr) = {
            let mut fields = self.fields.lock().await;
            if fields.connector.is_none() {
                return Err(TunnelError::Closed);
            }
            let node = fields.node.clone().ok_or(TunnelError::NotEstablished)?;
            if fields.app_listener.is_some() {
                return Err(TunnelError::AlreadyListening);
            }

            let listener = TcpListener::bind(address)
                .await
                .map_err(|source| TunnelError::Bind {
                    address: address.to_string(),
                    source,
                })?;
            let local_addr = listener.local_addr()?;

            let shutdown = CancellationToken::new();
            fields.app_listener = Some(AppListener {
                shutdown: shutdown.clone(),
                local_addr,
            });
            (listener, node, shutdown, local_addr)
        };

        info!(address = %local_addr, "Application listener bound");
        on_ready();

        Acceptor {
            listener,
            node,
            registry: self.registry.clone(),
            config: self.config.clone(),
            shutdown,
        }
        .spawn();

        Ok(local_addr)
    }

    /// Tear everything down
    ///
    /// Closes every registered application connection, the application
    /// listener, the node connection and the connector. Safe to call any
    /// number of times and concurrently with running read loops.
    pub async fn close(&self) {
        let mut fields = self.fields.lock().await;
        let Some(connector) = fields.connector.take() else {
            return;
        };

        let streams = self.registry.snapshot_for_close();
        debug!(streams = streams.len(), "Closing application connections");
        for conn in streams {
            conn.close();
        }

        if let Some(listener) = fields.app_listener.take() {
            listener.shutdown.cancel();
        }
        if let Some(node) = fields.node.take() {
            node.close().await;
        }
        connector.close().await;

        info!("Transport closed");
    }

    pub fn route(&self) -> &AppRoute {
        &self.route
    }

    /// Route announced by the peer's handshake, if one has arrived
    pub fn peer_route(&self) -> Option<AppRoute> {
        self.peer_route.get().copied()
    }

    pub async fn is_established(&self) -> bool {
        self.fields.lock().await.node.is_some()
    }

    pub async fn is_closed(&self) -> bool {
        self.fields.lock().await.connector.is_none()
    }

    pub async fn local_app_addr(&self) -> Option<SocketAddr> {
        self.fields
            .lock()
            .await
            .app_listener
            .as_ref()
            .map(|listener| listener.local_addr)
    }

    /// Registered stream ids, including ones still tearing down
    pub fn stream_count(&self) -> usize {
        self.registry.len()
    }

    pub fn active_streams(&self) -> usize {
        self.registry.active_streams()
    }

    pub fn stream_state(&self, id: StreamId) -> StreamState {
        self.registry.state(id)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("route", &self.route)
            .field("streams", &self.registry.len())
            .finish()
    }
}
