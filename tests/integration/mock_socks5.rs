//! Mock SOCKS5 server and UDP relay

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use tproxy_tunnel::address::Transport;
use tproxy_tunnel::socks5::RelayPacket;

// ============================================================================
// SOCKS5 Protocol Constants
// ============================================================================

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xff;
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;
pub const AUTH_REJECTED: u8 = 0xff;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// Configuration for mock SOCKS5 server behavior
#[derive(Clone)]
pub struct MockServerConfig {
    /// Require these credentials
    pub credentials: Option<(String, String)>,
    /// Force this method selection instead of the usual one
    pub method_reply: Option<u8>,
    /// Version byte of the method selection reply
    pub version_reply: u8,
    /// Reply code to send after the request
    pub reply_code: u8,
    /// Delay before answering the greeting
    pub response_delay: Duration,
    /// Bound address reported for UDP ASSOCIATE
    pub udp_relay: Option<SocketAddr>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            method_reply: None,
            version_reply: SOCKS5_VERSION,
            reply_code: REPLY_SUCCEEDED,
            response_delay: Duration::ZERO,
            udp_relay: None,
        }
    }
}

/// Handle to a running mock server
pub struct MockSocks5Server {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU32>,
    /// Raw request frames (`VER CMD RSV ATYP ADDR PORT`) in arrival order
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockSocks5Server {
    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

/// Start a mock server accepting any number of connections.
///
/// CONNECT tunnels echo everything back. UDP ASSOCIATE connections stay
/// open until the client closes them.
pub async fn spawn_server(config: MockServerConfig) -> MockSocks5Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU32::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn({
        let connections = Arc::clone(&connections);
        let requests = Arc::clone(&requests);
        async move {
            while let Ok((socket, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(socket, config.clone(), Arc::clone(&requests)));
            }
        }
    });

    MockSocks5Server {
        addr,
        connections,
        requests,
    }
}

async fn handle_connection(mut socket: TcpStream, config: MockServerConfig, requests: Arc<Mutex<Vec<Vec<u8>>>>) {
    // Method selection header: VER | NMETHODS | METHODS
    let mut header = [0u8; 2];
    if socket.read_exact(&mut header).await.is_err() || header[0] != SOCKS5_VERSION {
        return;
    }
    let mut methods = vec![0u8; header[1] as usize];
    if socket.read_exact(&mut methods).await.is_err() {
        return;
    }

    if !config.response_delay.is_zero() {
        tokio::time::sleep(config.response_delay).await;
    }

    let method = config.method_reply.unwrap_or(if config.credentials.is_some() {
        AUTH_METHOD_PASSWORD
    } else {
        AUTH_METHOD_NONE
    });
    if socket.write_all(&[config.version_reply, method]).await.is_err()
        || config.version_reply != SOCKS5_VERSION
        || method == AUTH_NO_ACCEPTABLE
    {
        return;
    }

    if method == AUTH_METHOD_PASSWORD && !authenticate(&mut socket, config.credentials.as_ref()).await {
        return;
    }

    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    let command = request[1];
    requests.lock().unwrap().push(request);

    let bound = match (command, config.udp_relay) {
        (CMD_UDP_ASSOCIATE, Some(relay)) => relay,
        _ => "127.0.0.1:0".parse().unwrap(),
    };
    let mut reply = vec![SOCKS5_VERSION, config.reply_code, 0x00];
    match bound.ip() {
        IpAddr::V4(ip) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&ip.octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());
    if socket.write_all(&reply).await.is_err() || config.reply_code != REPLY_SUCCEEDED {
        return;
    }

    // Echo for CONNECT; for ASSOCIATE just hold the control connection
    let mut buf = [0u8; 4096];
    loop {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) if command == CMD_CONNECT => {
                if socket.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
        }
    }
}

/// RFC 1929 sub-negotiation; returns whether the client was accepted
async fn authenticate(socket: &mut TcpStream, expected: Option<&(String, String)>) -> bool {
    let mut auth_header = [0u8; 2];
    if socket.read_exact(&mut auth_header).await.is_err() {
        return false;
    }
    let mut username = vec![0u8; auth_header[1] as usize];
    let mut plen = [0u8; 1];
    if socket.read_exact(&mut username).await.is_err() || socket.read_exact(&mut plen).await.is_err() {
        return false;
    }
    let mut password = vec![0u8; plen[0] as usize];
    if socket.read_exact(&mut password).await.is_err() {
        return false;
    }

    let ok = expected.map_or(true, |(u, p)| username == u.as_bytes() && password == p.as_bytes());
    // Clients only look at the first byte, so a rejection must land there
    let reply = if ok { [AUTH_PASSWORD_VERSION, 0x00] } else { [AUTH_REJECTED, AUTH_REJECTED] };
    let _ = socket.write_all(&reply).await;
    ok
}

async fn read_request(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut request = vec![0u8; 4];
    socket.read_exact(&mut request).await.ok()?;

    let addr_len = match request[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await.ok()?;
            request.push(len[0]);
            len[0] as usize
        }
        _ => return None,
    };

    let mut rest = vec![0u8; addr_len + 2];
    socket.read_exact(&mut rest).await.ok()?;
    request.extend_from_slice(&rest);
    Some(request)
}

/// Start a UDP relay that answers every envelope with `reply:` + payload,
/// addressed from the envelope's destination.
pub async fn spawn_udp_relay() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let Ok(packet) = RelayPacket::decode(Bytes::copy_from_slice(&buf[..n])) else {
                continue;
            };
            let mut payload = b"reply:".to_vec();
            payload.extend_from_slice(&packet.payload);
            let Ok(frame) = RelayPacket::new(packet.address, payload).encode(Transport::Udp) else {
                continue;
            };
            let _ = socket.send_to(&frame, from).await;
        }
    });

    addr
}
