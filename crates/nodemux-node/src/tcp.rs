//! TCP node transport
//!
//! Carries each node message as one length-delimited frame over a plain TCP
//! stream. Two pump tasks bridge the socket and a [`ChannelConnection`]:
//! the reader pushes decoded frames into the inbound queue and the writer
//! drains the outbound queue into the socket. Either pump ending cancels the
//! link, which stops the other.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    ChannelConnection, NodeConfig, NodeConnection, NodeConnector, NodeError, NodeListener,
    NodeResult,
};

/// Wrap an established byte stream as a node connection
///
/// Spawns the reader and writer pumps on the current runtime.
pub fn spawn_framed<S>(io: S, connection_id: String, config: &NodeConfig) -> ChannelConnection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(config.max_message_size)
        .new_codec();
    let (mut sink, mut stream) = Framed::new(io, codec).split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(config.queue_capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(config.queue_capacity);
    let link = CancellationToken::new();

    let reader_link = link.clone();
    let reader_id = connection_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_link.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        trace!("{}: received {} bytes", reader_id, frame.len());
                        if inbound_tx.send(frame.freeze()).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("{}: read error: {}", reader_id, e);
                        break;
                    }
                    None => {
                        debug!("{}: closed by peer", reader_id);
                        break;
                    }
                }
            }
        }
        reader_link.cancel();
    });

    let writer_link = link.clone();
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_link.cancelled() => break,
                message = outbound_rx.recv() => match message {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            warn!("{}: write error: {}", writer_id, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        writer_link.cancel();
        let _ = sink.close().await;
        debug!("{}: writer stopped", writer_id);
    });

    ChannelConnection::new(
        connection_id,
        outbound_tx,
        inbound_rx,
        link,
        config.max_message_size,
    )
}

/// Dials node connections over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpNodeConnector {
    config: NodeConfig,
}

impl TcpNodeConnector {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NodeConnector for TcpNodeConnector {
    async fn connect(&self, address: &str) -> NodeResult<Arc<dyn NodeConnection>> {
        debug!("Connecting to node {}", address);

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| NodeError::Timeout)?
            .map_err(|e| NodeError::ConnectionError(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        let peer = stream.peer_addr()?;
        info!("Node connection established to {}", peer);

        Ok(Arc::new(spawn_framed(
            stream,
            format!("tcp-{}", peer),
            &self.config,
        )))
    }
}

/// Accepts node connections over TCP
#[derive(Debug)]
pub struct TcpNodeListener {
    listener: TcpListener,
    config: NodeConfig,
}

impl TcpNodeListener {
    pub async fn bind(address: &str, config: NodeConfig) -> NodeResult<Self> {
        let listener = TcpListener::bind(address).await?;
        info!("Node listener bound to {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }
}

#[async_trait]
impl NodeListener for TcpNodeListener {
    async fn accept(&self) -> NodeResult<(Arc<dyn NodeConnection>, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!("Node connection accepted from {}", remote);

        let connection = spawn_framed(stream, format!("tcp-{}", remote), &self.config);
        Ok((Arc::new(connection), remote))
    }

    fn local_addr(&self) -> NodeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
