//! Transparent dialer
//!
//! Opens outbound sockets that carry the transparency option, are bound to a
//! caller-chosen (possibly non-local) address and are connected to a remote
//! endpoint. Used for upstream proxy connections, bypass connections and
//! spoofed-source UDP reply sockets.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Socket};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace, warn};

use super::socket::{default_socket_provider, SocketProvider};
use crate::address::Transport;
use crate::error::SocketError;

/// One side of a dial: transport plus socket address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: Transport,
    pub addr: SocketAddr,
}

impl Endpoint {
    #[must_use]
    pub const fn tcp(addr: SocketAddr) -> Self {
        Self {
            transport: Transport::Tcp,
            addr,
        }
    }

    #[must_use]
    pub const fn udp(addr: SocketAddr) -> Self {
        Self {
            transport: Transport::Udp,
            addr,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.addr)
    }
}

/// A connected transparent socket
#[derive(Debug)]
pub enum DialedSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Dials transparent outbound connections through a [`SocketProvider`]
#[derive(Clone)]
pub struct TransparentDialer {
    provider: Arc<dyn SocketProvider>,
}

impl fmt::Debug for TransparentDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransparentDialer").finish_non_exhaustive()
    }
}

impl Default for TransparentDialer {
    fn default() -> Self {
        Self::new(default_socket_provider())
    }
}

impl TransparentDialer {
    pub fn new(provider: Arc<dyn SocketProvider>) -> Self {
        Self { provider }
    }

    /// Socket provider used for new descriptors
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn SocketProvider> {
        &self.provider
    }

    /// Bind to `local` and connect to `remote`.
    ///
    /// IPv4-mapped IPv6 addresses are treated as IPv4.
    ///
    /// # Errors
    ///
    /// - `AddressFamilyMismatch` if the endpoints differ in family or transport
    /// - `PrivilegeDenied` if the transparency option is refused
    /// - `Bind` / `Connect` / `Option` for other syscall failures
    ///
    /// The descriptor is closed before any error is returned.
    pub async fn dial(&self, local: Endpoint, remote: Endpoint) -> Result<DialedSocket, SocketError> {
        let (socket, remote_addr) = self.bound_socket(local, remote)?;
        match local.transport {
            Transport::Tcp => connect_tcp(socket, remote_addr).await.map(DialedSocket::Tcp),
            Transport::Udp => connect_udp(socket, remote_addr).map(DialedSocket::Udp),
        }
    }

    /// Dial a TCP connection
    ///
    /// # Errors
    ///
    /// See [`TransparentDialer::dial`].
    pub async fn dial_tcp(&self, local: SocketAddr, remote: SocketAddr) -> Result<TcpStream, SocketError> {
        let (socket, remote_addr) = self.bound_socket(Endpoint::tcp(local), Endpoint::tcp(remote))?;
        connect_tcp(socket, remote_addr).await
    }

    /// Dial a connected UDP socket
    ///
    /// # Errors
    ///
    /// See [`TransparentDialer::dial`].
    pub fn dial_udp(&self, local: SocketAddr, remote: SocketAddr) -> Result<UdpSocket, SocketError> {
        let (socket, remote_addr) = self.bound_socket(Endpoint::udp(local), Endpoint::udp(remote))?;
        connect_udp(socket, remote_addr)
    }

    /// Validate the endpoint pair, create the socket and bind it
    fn bound_socket(&self, local: Endpoint, remote: Endpoint) -> Result<(Socket, SocketAddr), SocketError> {
        let local_addr = canonical(local.addr);
        let remote_addr = canonical(remote.addr);

        if local.transport != remote.transport || local_addr.is_ipv4() != remote_addr.is_ipv4() {
            return Err(SocketError::AddressFamilyMismatch {
                local: local.to_string(),
                remote: remote.to_string(),
            });
        }

        let domain = if remote_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = self.provider.transparent_socket(domain, local.transport)?;

        socket
            .bind(&local_addr.into())
            .map_err(|source| SocketError::Bind {
                addr: local_addr,
                source,
            })?;
        trace!(local = %local_addr, remote = %remote_addr, transport = %local.transport, "Bound transparent socket");

        Ok((socket, remote_addr))
    }
}

/// Collapse IPv4-mapped IPv6 to IPv4
fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

async fn connect_tcp(socket: Socket, remote: SocketAddr) -> Result<TcpStream, SocketError> {
    let connect_err = |source| SocketError::Connect {
        addr: remote,
        source,
    };

    // Non-blocking connect
    match socket.connect(&remote.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(connect_err(e)),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream).map_err(connect_err)?;

    stream.writable().await.map_err(connect_err)?;
    match stream.take_error() {
        Ok(None) => {}
        Ok(Some(e)) | Err(e) => return Err(connect_err(e)),
    }

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", remote, e);
    }

    debug!("Transparent TCP connection established to {}", remote);
    Ok(stream)
}

fn connect_udp(socket: Socket, remote: SocketAddr) -> Result<UdpSocket, SocketError> {
    socket
        .connect(&remote.into())
        .map_err(|source| SocketError::Connect {
            addr: remote,
            source,
        })?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| SocketError::Connect {
        addr: remote,
        source: io::Error::new(e.kind(), format!("failed to register socket: {e}")),
    })
}
