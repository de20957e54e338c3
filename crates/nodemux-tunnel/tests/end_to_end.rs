//! End-to-end tests - two transports over a real TCP node connection
//!
//! ```text
//! client ──TCP──▶ [acceptor] transport B ══node══ transport A [dialer] ──TCP──▶ echo server
//! ```

use nodemux_node::{NodeConfig, NodeListener, TcpNodeConnector, TcpNodeListener};
use nodemux_proto::{AppRoute, PubKey};
use nodemux_tunnel::{Transport, TunnelConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn start_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    info!("Echo server listening on {}", addr);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

fn route() -> AppRoute {
    AppRoute::new(
        PubKey::new([0xa1; 32]),
        PubKey::new([0xb2; 32]),
        PubKey::new([0xc3; 32]),
        PubKey::new([0xd4; 32]),
    )
}

struct Tunnel {
    dialer: Arc<Transport>,
    acceptor: Arc<Transport>,
    app_addr: SocketAddr,
}

/// Wire a dialing transport (towards the echo server) and an accepting
/// transport (facing clients) over one TCP node connection
async fn start_tunnel(node_config: NodeConfig) -> Tunnel {
    let echo_addr = start_echo_server().await;

    let listener = TcpNodeListener::bind("127.0.0.1:0", node_config.clone())
        .await
        .unwrap();
    let node_addr = listener.local_addr().unwrap().to_string();
    let accepted = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let dialer = Arc::new(Transport::new(
        Arc::new(TcpNodeConnector::new(node_config.clone())),
        route(),
        TunnelConfig::default(),
    ));
    dialer.connect(&node_addr, &echo_addr).await.unwrap();

    let acceptor = Arc::new(Transport::new(
        Arc::new(TcpNodeConnector::new(node_config)),
        route().reversed(),
        TunnelConfig::default(),
    ));
    acceptor.adopt(accepted.await.unwrap()).await.unwrap();
    let app_addr = acceptor
        .listen_for_app("127.0.0.1:0", || info!("Tunnel ready"))
        .await
        .unwrap();

    Tunnel {
        dialer,
        acceptor,
        app_addr,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_reaches_accepting_side() {
    init_tracing();
    let tunnel = start_tunnel(NodeConfig::default()).await;

    let acceptor = tunnel.acceptor.clone();
    wait_until(move || acceptor.peer_route().is_some()).await;
    assert_eq!(tunnel.acceptor.peer_route(), Some(route()));

    // The dialing side never receives a handshake
    assert!(tunnel.dialer.peer_route().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bytes_arrive_in_order() {
    init_tracing();
    // Small node messages force many frames per write
    let tunnel = start_tunnel(NodeConfig {
        max_message_size: 256,
        ..Default::default()
    })
    .await;

    let mut client = TcpStream::connect(tunnel.app_addr).await.unwrap();
    let sent = pattern(7, 64 * 1024);

    let (mut reader, mut writer) = client.split();
    let write = async {
        for chunk in sent.chunks(1000) {
            writer.write_all(chunk).await.unwrap();
        }
    };
    let read = async {
        let mut received = vec![0u8; sent.len()];
        reader.read_exact(&mut received).await.unwrap();
        received
    };

    let ((), received) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(write, read)
    })
    .await
    .expect("echo did not complete");
    assert!(received == sent, "stream bytes reordered or corrupted");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streams_are_isolated() {
    init_tracing();
    let tunnel = start_tunnel(NodeConfig::default()).await;

    let mut clients = Vec::new();
    for seed in [11u8, 97u8, 201u8] {
        let app_addr = tunnel.app_addr;
        clients.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(app_addr).await.unwrap();
            let sent = pattern(seed, 20_000);
            let mut received = vec![0u8; sent.len()];

            let (mut reader, mut writer) = client.split();
            let write = async {
                for chunk in sent.chunks(333) {
                    writer.write_all(chunk).await.unwrap();
                }
            };
            let read = reader.read_exact(&mut received);
            let ((), read) = tokio::join!(write, read);
            read.unwrap();

            received == sent
        }));
    }

    for client in clients {
        let intact = tokio::time::timeout(Duration::from_secs(10), client)
            .await
            .expect("client timed out")
            .unwrap();
        assert!(intact, "payload leaked between streams");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_propagates_and_clears_both_registries() {
    init_tracing();
    let tunnel = start_tunnel(NodeConfig::default()).await;

    let mut client = TcpStream::connect(tunnel.app_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert_eq!(tunnel.acceptor.stream_count(), 1);
    assert_eq!(tunnel.dialer.stream_count(), 1);

    drop(client);

    let (dialer, acceptor) = (tunnel.dialer.clone(), tunnel.acceptor.clone());
    wait_until(move || dialer.stream_count() == 0 && acceptor.stream_count() == 0).await;
    assert_eq!(tunnel.dialer.stream_state(1), nodemux_tunnel::StreamState::Absent);
    assert_eq!(tunnel.acceptor.stream_state(1), nodemux_tunnel::StreamState::Absent);

    // The tunnel keeps serving new streams
    let mut client = TcpStream::connect(tunnel.app_addr).await.unwrap();
    client.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"again");
    assert_eq!(tunnel.acceptor.stream_state(2), nodemux_tunnel::StreamState::Active);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_side_close_reaches_client() {
    init_tracing();
    // Application that answers once and hangs up
    let app = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app_addr = app.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut socket, _) = app.accept().await.unwrap();
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(b"bye").await.unwrap();
    });

    let listener = TcpNodeListener::bind("127.0.0.1:0", NodeConfig::default())
        .await
        .unwrap();
    let node_addr = listener.local_addr().unwrap().to_string();
    let accepted = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let dialer = Transport::new(
        Arc::new(TcpNodeConnector::default()),
        route(),
        TunnelConfig::default(),
    );
    dialer.connect(&node_addr, &app_addr).await.unwrap();
    let acceptor = Transport::new(
        Arc::new(TcpNodeConnector::default()),
        route().reversed(),
        TunnelConfig::default(),
    );
    acceptor.adopt(accepted.await.unwrap()).await.unwrap();
    let entry = acceptor.listen_for_app("127.0.0.1:0", || {}).await.unwrap();

    let mut client = TcpStream::connect(entry).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .expect("client should see EOF")
        .unwrap();
    assert_eq!(received, b"bye");

    wait_until(|| dialer.stream_count() == 0 && acceptor.stream_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closing_one_side_ends_the_other() {
    init_tracing();
    let tunnel = start_tunnel(NodeConfig::default()).await;

    let mut client = TcpStream::connect(tunnel.app_addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();

    tunnel.dialer.close().await;

    // The accepting side notices on its next forward and hangs up
    let _ = client.write_all(b"y").await;
    let mut rest = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
    assert!(result.is_ok(), "client stream should end");
    assert!(tunnel.dialer.is_closed().await);
}
