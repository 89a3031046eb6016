//! Many TCP sessions through the connection manager

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tproxy_tunnel::address::AddressSpec;
use tproxy_tunnel::config::{ConnectionConfig, ProxyConfig};
use tproxy_tunnel::connection::ConnectionManager;
use tproxy_tunnel::error::{ConnectionError, ErrorKind};
use tproxy_tunnel::tproxy::TproxyConnection;

use super::mock_socks5::{spawn_server, MockServerConfig};
use super::session_context;

const CONCURRENT_SESSIONS: usize = 100;

fn manager(max_connections: usize, upstream: Option<ProxyConfig>) -> Arc<ConnectionManager> {
    let config = ConnectionConfig {
        max_connections,
        buffer_size: 8192,
        drain_timeout_secs: 1,
    };
    Arc::new(ConnectionManager::new(&config, session_context(upstream)))
}

/// Stands in for the TPROXY listener: each accepted stream is handed over
/// with a fixed destination.
struct FakeIntercept {
    listener: TcpListener,
}

impl FakeIntercept {
    async fn new() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    async fn intercept(&self, destination: &AddressSpec) -> (TcpStream, TproxyConnection) {
        let client = TcpStream::connect(self.listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = self.listener.accept().await.unwrap();
        let conn = TproxyConnection::with_destination(stream, peer, destination.clone()).unwrap();
        (client, conn)
    }
}

async fn echo_round_trip(mut client: TcpStream, payload: Vec<u8>) {
    client.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("session should finish")
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_socks5_sessions() {
    let server = spawn_server(MockServerConfig::default()).await;
    let manager = manager(CONCURRENT_SESSIONS * 2, Some(ProxyConfig::new(server.addr)));
    let intercept = FakeIntercept::new().await;
    let destination = AddressSpec::parse("203.0.113.7", 443).unwrap();

    let mut sessions = Vec::with_capacity(CONCURRENT_SESSIONS);
    let mut clients = Vec::with_capacity(CONCURRENT_SESSIONS);
    for i in 0..CONCURRENT_SESSIONS {
        let (client, conn) = intercept.intercept(&destination).await;
        sessions.push(manager.handle_connection(conn).unwrap());
        clients.push(tokio::spawn(echo_round_trip(client, format!("session-{i:03}").into_bytes())));
    }

    join_all(clients).await;
    join_all(sessions).await;

    let stats = manager.stats_snapshot();
    assert_eq!(stats.tcp_accepted, CONCURRENT_SESSIONS as u64);
    assert_eq!(stats.established, CONCURRENT_SESSIONS as u64);
    assert_eq!(stats.completed, CONCURRENT_SESSIONS as u64);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.bytes_up, (CONCURRENT_SESSIONS * 11) as u64);
    assert_eq!(stats.bytes_down, (CONCURRENT_SESSIONS * 11) as u64);
    assert_eq!(server.connection_count(), CONCURRENT_SESSIONS as u32);
    assert_eq!(manager.available_slots(), CONCURRENT_SESSIONS * 2);
}

#[tokio::test]
async fn test_direct_sessions() {
    let echo = spawn_echo_server().await;
    let manager = manager(16, None);
    let intercept = FakeIntercept::new().await;
    let destination = AddressSpec::from(echo);

    let mut sessions = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..8 {
        let (client, conn) = intercept.intercept(&destination).await;
        sessions.push(manager.handle_connection(conn).unwrap());
        clients.push(tokio::spawn(echo_round_trip(client, b"direct".to_vec())));
    }

    join_all(clients).await;
    join_all(sessions).await;

    let stats = manager.stats_snapshot();
    assert_eq!(stats.completed, 8);
    assert_eq!(stats.bytes_up, 48);
}

#[tokio::test]
async fn test_failures_counted_by_kind() {
    let server = spawn_server(MockServerConfig {
        reply_code: 0x02,
        ..Default::default()
    })
    .await;
    let manager = manager(16, Some(ProxyConfig::new(server.addr)));
    let intercept = FakeIntercept::new().await;
    let destination = AddressSpec::parse("198.51.100.1", 80).unwrap();

    let mut sessions = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..4 {
        let (client, conn) = intercept.intercept(&destination).await;
        sessions.push(manager.handle_connection(conn).unwrap());
        clients.push(client);
    }
    join_all(sessions).await;

    // The client side is closed once negotiation fails
    for mut client in clients {
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    let stats = manager.stats();
    assert_eq!(stats.failed(), 4);
    assert_eq!(stats.established(), 0);
    assert_eq!(stats.failures(ErrorKind::ConnectRejected), 4);
    assert_eq!(manager.stats_snapshot().failures.get("connect_rejected"), Some(&4));
}

#[tokio::test]
async fn test_admission_limit_and_release() {
    let server = spawn_server(MockServerConfig::default()).await;
    let manager = manager(2, Some(ProxyConfig::new(server.addr)));
    let intercept = FakeIntercept::new().await;
    let destination = AddressSpec::parse("192.0.2.1", 80).unwrap();

    let (first, conn) = intercept.intercept(&destination).await;
    let first_session = manager.handle_connection(conn).unwrap();
    let (second, conn) = intercept.intercept(&destination).await;
    let second_session = manager.handle_connection(conn).unwrap();
    assert!(manager.at_capacity());

    let (_third, conn) = intercept.intercept(&destination).await;
    match manager.handle_connection(conn) {
        Err(ConnectionError::LimitReached { current: 2, max: 2 }) => {}
        other => panic!("expected LimitReached, got {:?}", other.map(|_| ())),
    }
    assert_eq!(manager.stats().rejected(), 1);

    echo_round_trip(first, b"one".to_vec()).await;
    join_all(vec![first_session]).await;
    assert_eq!(manager.available_slots(), 1);

    let (fourth, conn) = intercept.intercept(&destination).await;
    let fourth_session = manager.handle_connection(conn).unwrap();

    echo_round_trip(second, b"two".to_vec()).await;
    echo_round_trip(fourth, b"four".to_vec()).await;
    join_all(vec![second_session, fourth_session]).await;
    assert_eq!(manager.available_slots(), 2);
}

#[tokio::test]
async fn test_shutdown_drains_then_refuses() {
    let server = spawn_server(MockServerConfig::default()).await;
    let manager = manager(4, Some(ProxyConfig::new(server.addr)));
    let intercept = FakeIntercept::new().await;
    let destination = AddressSpec::parse("192.0.2.2", 80).unwrap();

    // Never closed by the client, so only the drain abort ends it
    let (_idle_client, conn) = intercept.intercept(&destination).await;
    let idle_session = manager.handle_connection(conn).unwrap();

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .expect("shutdown should finish after the drain timeout");
    join_all(vec![idle_session]).await;
    assert_eq!(manager.active_connections(), 0);

    let (_late, conn) = intercept.intercept(&destination).await;
    assert!(matches!(
        manager.handle_connection(conn),
        Err(ConnectionError::ShuttingDown)
    ));
}
