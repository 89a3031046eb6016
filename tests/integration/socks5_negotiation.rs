//! SOCKS5 negotiator against a mock server over real TCP

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use tproxy_tunnel::address::AddressSpec;
use tproxy_tunnel::config::AuthCredential;
use tproxy_tunnel::error::{ErrorKind, NegotiationError};
use tproxy_tunnel::socks5::{NegotiationState, Socks5Negotiator};

use super::mock_socks5::{
    spawn_server, MockServerConfig, ATYP_DOMAIN, ATYP_IPV6, AUTH_NO_ACCEPTABLE, CMD_CONNECT,
    CMD_UDP_ASSOCIATE, REPLY_CONNECTION_REFUSED, SOCKS5_VERSION,
};

fn target() -> AddressSpec {
    AddressSpec::Ipv4(Ipv4Addr::new(93, 184, 216, 34), 443)
}

async fn negotiate(
    config: MockServerConfig,
    credential: AuthCredential,
    destination: &AddressSpec,
) -> (Socks5Negotiator, Result<(), NegotiationError>, TcpStream) {
    let server = spawn_server(config).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut negotiator = Socks5Negotiator::new(credential).with_deadline(Instant::now() + Duration::from_secs(2));
    let result = negotiator.connect(&mut stream, destination).await;
    (negotiator, result, stream)
}

// ============================================================================
// Successful negotiation
// ============================================================================

#[tokio::test]
async fn test_connect_without_auth() {
    let server = spawn_server(MockServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut negotiator = Socks5Negotiator::new(AuthCredential::none());
    negotiator.connect(&mut stream, &target()).await.unwrap();
    assert_eq!(negotiator.state(), NegotiationState::Established);

    // The stream is now a pipe through the mock's echo
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0], vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xbb]);
}

#[tokio::test]
async fn test_connect_with_auth() {
    let config = MockServerConfig {
        credentials: Some(("alice".into(), "secret".into())),
        ..Default::default()
    };
    let (negotiator, result, _stream) = negotiate(config, AuthCredential::new("alice", "secret"), &target()).await;

    result.unwrap();
    assert_eq!(negotiator.state(), NegotiationState::Established);
}

#[tokio::test]
async fn test_connect_domain_target() {
    let server = spawn_server(MockServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let destination = AddressSpec::Domain("example.com".into(), 8080);
    Socks5Negotiator::new(AuthCredential::none())
        .connect(&mut stream, &destination)
        .await
        .unwrap();

    let request = &server.requests()[0];
    assert_eq!(request[3], ATYP_DOMAIN);
    assert_eq!(request[4] as usize, "example.com".len());
    assert_eq!(&request[5..16], b"example.com");
    assert_eq!(&request[16..], &8080u16.to_be_bytes());
}

#[tokio::test]
async fn test_connect_ipv6_target() {
    let server = spawn_server(MockServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let destination = AddressSpec::Ipv6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 53);
    Socks5Negotiator::new(AuthCredential::none())
        .connect(&mut stream, &destination)
        .await
        .unwrap();

    let request = &server.requests()[0];
    assert_eq!(request[3], ATYP_IPV6);
    assert_eq!(request.len(), 4 + 16 + 2);
}

#[tokio::test]
async fn test_udp_associate_returns_bound_address() {
    let relay = "127.0.0.1:40404".parse().unwrap();
    let server = spawn_server(MockServerConfig {
        udp_relay: Some(relay),
        ..Default::default()
    })
    .await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut negotiator = Socks5Negotiator::new(AuthCredential::none());
    let bound = negotiator.udp_associate(&mut stream).await.unwrap();
    assert_eq!(bound, AddressSpec::from(relay));
    assert_eq!(server.requests()[0][1], CMD_UDP_ASSOCIATE);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_wrong_password_rejected() {
    let config = MockServerConfig {
        credentials: Some(("alice".into(), "secret".into())),
        ..Default::default()
    };
    let (negotiator, result, _stream) = negotiate(config, AuthCredential::new("alice", "wrong"), &target()).await;

    let err = result.unwrap_err();
    assert!(matches!(err, NegotiationError::AuthRejected(0xff)));
    assert_eq!(err.kind(), ErrorKind::AuthRejected);
    assert_eq!(negotiator.state(), NegotiationState::Failed);
}

#[tokio::test]
async fn test_no_acceptable_method() {
    let config = MockServerConfig {
        method_reply: Some(AUTH_NO_ACCEPTABLE),
        ..Default::default()
    };
    let (negotiator, result, _stream) = negotiate(config, AuthCredential::none(), &target()).await;

    assert!(matches!(result, Err(NegotiationError::MethodRejected(0xff))));
    assert_eq!(negotiator.state(), NegotiationState::Failed);
}

#[tokio::test]
async fn test_version_mismatch() {
    let config = MockServerConfig {
        version_reply: 0x04,
        ..Default::default()
    };
    let (_negotiator, result, _stream) = negotiate(config, AuthCredential::none(), &target()).await;

    assert!(matches!(
        result,
        Err(NegotiationError::ProtocolVersionMismatch { expected: 5, actual: 4 })
    ));
}

#[tokio::test]
async fn test_connect_refused() {
    let config = MockServerConfig {
        reply_code: REPLY_CONNECTION_REFUSED,
        ..Default::default()
    };
    let (_negotiator, result, _stream) = negotiate(config, AuthCredential::none(), &target()).await;

    let err = result.unwrap_err();
    assert!(matches!(err, NegotiationError::ConnectRejected { version: 5, code: 0x05 }));
    assert!(err.to_string().contains("refused"));
}

#[tokio::test]
async fn test_timeout_reports_state() {
    let config = MockServerConfig {
        response_delay: Duration::from_secs(5),
        ..Default::default()
    };
    let server = spawn_server(config).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut negotiator =
        Socks5Negotiator::new(AuthCredential::none()).with_deadline(Instant::now() + Duration::from_millis(100));
    let err = negotiator.connect(&mut stream, &target()).await.unwrap_err();

    assert!(matches!(
        err,
        NegotiationError::NegotiationTimeout {
            state: NegotiationState::GreetingSent
        }
    ));
    assert_eq!(negotiator.state(), NegotiationState::Failed);
}

#[tokio::test]
async fn test_server_closes_mid_negotiation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        socket.read_exact(&mut greeting).await.unwrap();
        // Close without answering
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let err = Socks5Negotiator::new(AuthCredential::none())
        .connect(&mut stream, &target())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

// ============================================================================
// Lenient server behavior
// ============================================================================

/// Some servers answer the auth sub-negotiation with `01 01` on success
#[tokio::test]
async fn test_auth_status_byte_one_accepted() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 4];
        socket.read_exact(&mut greeting).await.unwrap();
        socket.write_all(&[0x05, 0x02]).await.unwrap();

        // 01 | 03 bob | 02 pw
        let mut auth = [0u8; 1 + 1 + 3 + 1 + 2];
        socket.read_exact(&mut auth).await.unwrap();
        socket.write_all(&[0x01, 0x01]).await.unwrap();

        let mut request = [0u8; 10];
        socket.read_exact(&mut request).await.unwrap();
        socket.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut negotiator = Socks5Negotiator::new(AuthCredential::new("bob", "pw"));
    negotiator.connect(&mut stream, &target()).await.unwrap();
    assert_eq!(negotiator.state(), NegotiationState::Established);
}

#[tokio::test]
async fn test_negotiator_is_single_use() {
    let server = spawn_server(MockServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut negotiator = Socks5Negotiator::new(AuthCredential::none());
    negotiator.connect(&mut stream, &target()).await.unwrap();

    let mut other = TcpStream::connect(server.addr).await.unwrap();
    assert!(negotiator.connect(&mut other, &target()).await.is_err());
}
