//! UDP ASSOCIATE sessions against a mock relay

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use tproxy_tunnel::address::{AddressSpec, Transport};
use tproxy_tunnel::config::ProxyConfig;
use tproxy_tunnel::error::{ErrorKind, FramingError, TunnelError};
use tproxy_tunnel::session::{run_tunnel, Tunnel, UdpTunnelSession};
use tproxy_tunnel::socks5::{NegotiationState, RelayPacket};
use tproxy_tunnel::tproxy::InterceptedFlow;

use super::mock_socks5::{spawn_server, spawn_udp_relay, MockServerConfig, REPLY_CONNECTION_REFUSED};
use super::session_context;

fn udp_flow(client: SocketAddr, destination: SocketAddr) -> InterceptedFlow {
    InterceptedFlow {
        transport: Transport::Udp,
        client,
        local: "127.0.0.1:7893".parse().unwrap(),
        destination: AddressSpec::from(destination),
        control: None,
    }
}

#[tokio::test]
async fn test_associate_and_exchange() {
    let relay = spawn_udp_relay().await;
    let server = spawn_server(MockServerConfig {
        udp_relay: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, relay.port()))),
        ..Default::default()
    })
    .await;

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let destination: SocketAddr = "127.0.0.10:5353".parse().unwrap();
    let (tx, rx) = mpsc::channel(16);
    let mut session = UdpTunnelSession::new(
        session_context(Some(ProxyConfig::new(server.addr))),
        udp_flow(app.local_addr().unwrap(), destination),
        rx,
    );
    assert_eq!(session.key().to_string(), "udp/socks5/default");

    session.negotiate().await.unwrap();
    assert_eq!(session.state(), NegotiationState::Established);
    // Unspecified bound address is replaced by the proxy's IP
    assert_eq!(session.relay_addr(), Some(relay));

    let driver = tokio::spawn(async move { run_tunnel(&mut session).await });

    let mut buf = [0u8; 256];
    for query in [&b"first"[..], &b"second"[..]] {
        tx.send(Bytes::copy_from_slice(query)).await.unwrap();
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), app.recv_from(&mut buf))
            .await
            .expect("reply should arrive")
            .unwrap();
        assert_eq!(from, destination);
        assert_eq!(&buf[..n], [&b"reply:"[..], query].concat().as_slice());
    }

    drop(tx);
    let copied = driver.await.unwrap().unwrap();
    assert_eq!(copied.client_to_upstream, 11);
    assert_eq!(copied.upstream_to_client, 23);
}

#[tokio::test]
async fn test_associate_refused() {
    let server = spawn_server(MockServerConfig {
        reply_code: REPLY_CONNECTION_REFUSED,
        ..Default::default()
    })
    .await;

    let (_tx, rx) = mpsc::channel(1);
    let mut session = UdpTunnelSession::new(
        session_context(Some(ProxyConfig::new(server.addr))),
        udp_flow("127.0.0.1:40100".parse().unwrap(), "127.0.0.11:5353".parse().unwrap()),
        rx,
    );

    let err = run_tunnel(&mut session).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectRejected);
    assert_eq!(session.state(), NegotiationState::Failed);
}

#[tokio::test]
async fn test_idle_session_ends() {
    let relay = spawn_udp_relay().await;
    let server = spawn_server(MockServerConfig {
        udp_relay: Some(relay),
        ..Default::default()
    })
    .await;

    let mut ctx = session_context(Some(ProxyConfig::new(server.addr)));
    ctx.udp_idle_timeout = Duration::from_millis(200);
    let (_tx, rx) = mpsc::channel(1);
    let mut session = UdpTunnelSession::new(
        ctx,
        udp_flow("127.0.0.1:40101".parse().unwrap(), "127.0.0.12:5353".parse().unwrap()),
        rx,
    );

    // Nothing flows, so the idle timeout ends the relay cleanly
    let copied = tokio::time::timeout(Duration::from_secs(5), run_tunnel(&mut session))
        .await
        .expect("idle session should end")
        .unwrap();
    assert_eq!(copied.total(), 0);
}

// ============================================================================
// Relay framing edge cases
// ============================================================================

#[test]
fn test_encode_rejects_tcp() {
    let packet = RelayPacket::new(AddressSpec::Ipv4(Ipv4Addr::LOCALHOST, 53), Bytes::from_static(b"q"));
    let err = packet.encode(Transport::Tcp).unwrap_err();
    assert!(matches!(err, FramingError::UnsupportedTransport(Transport::Tcp)));
    assert_eq!(TunnelError::from(err).kind(), ErrorKind::UnsupportedTransport);
}

#[test]
fn test_encode_domain_destination() {
    let packet = RelayPacket::new(AddressSpec::Domain("dns.example".into(), 53), Bytes::from_static(b"q"));
    let frame = packet.encode(Transport::Udp).unwrap();
    assert_eq!(&frame[..4], &[0, 0, 0, 0x03]);
    assert_eq!(frame[4] as usize, "dns.example".len());
    assert_eq!(&frame[frame.len() - 3..], &[0, 53, b'q']);
}

#[test]
fn test_encode_rejects_long_domain() {
    let packet = RelayPacket::new(AddressSpec::Domain("a".repeat(256), 53), Bytes::new());
    assert!(matches!(
        packet.encode(Transport::Udp),
        Err(FramingError::NameTooLong(256))
    ));
}

#[test]
fn test_decode_rejects_ipv6_and_short_frames() {
    let mut ipv6 = vec![0, 0, 0, 0x04];
    ipv6.extend_from_slice(&[0u8; 18]);
    assert!(matches!(
        RelayPacket::decode(Bytes::from(ipv6)),
        Err(FramingError::UnsupportedAddressType(0x04))
    ));

    assert!(matches!(
        RelayPacket::decode(Bytes::from_static(&[0, 0, 0, 1, 127])),
        Err(FramingError::Truncated { needed: 10, actual: 5 })
    ));
}

#[test]
fn test_decode_empty_payload() {
    let packet = RelayPacket::decode(Bytes::from_static(&[0, 0, 0, 1, 10, 0, 0, 1, 0, 53])).unwrap();
    assert_eq!(packet.address, AddressSpec::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 53));
    assert!(packet.payload.is_empty());
}
