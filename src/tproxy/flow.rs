//! Intercepted flows
//!
//! Whatever the listeners hand to the session layer: the client-facing side
//! of a redirected TCP connection or UDP datagram, with its original
//! destination already recovered.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::debug;

use super::socket::original_dst;
use crate::address::{AddressSpec, Transport};
use crate::error::RecoveryError;

/// Metadata of one intercepted flow
#[derive(Debug, Clone)]
pub struct InterceptedFlow {
    pub transport: Transport,
    /// Client (source) address
    pub client: SocketAddr,
    /// Address of the proxy socket that received the flow
    pub local: SocketAddr,
    /// Destination the client originally addressed
    pub destination: AddressSpec,
    /// Raw ancillary data the destination was parsed from (UDP only)
    pub control: Option<Bytes>,
}

impl InterceptedFlow {
    /// Original destination as a socket address
    ///
    /// Recovered destinations are always literal.
    #[must_use]
    pub fn destination_addr(&self) -> Option<SocketAddr> {
        self.destination.to_socket_addr()
    }
}

/// An accepted, redirected TCP connection
#[derive(Debug)]
pub struct TproxyConnection {
    stream: TcpStream,
    flow: InterceptedFlow,
    accepted_at: Instant,
}

impl TproxyConnection {
    /// Wrap an accepted stream, recovering its original destination.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryError::Unavailable` if the connection was not redirected.
    pub fn new(stream: TcpStream, client: SocketAddr) -> Result<Self, RecoveryError> {
        let destination = original_dst(&stream)?;
        debug!("TPROXY connection: {} -> {} (original)", client, destination);
        Self::with_destination(stream, client, destination)
    }

    /// Wrap a stream whose destination is already known.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryError::Unavailable` if the local address cannot be read.
    pub fn with_destination(
        stream: TcpStream,
        client: SocketAddr,
        destination: AddressSpec,
    ) -> Result<Self, RecoveryError> {
        let local = stream
            .local_addr()
            .map_err(|e| RecoveryError::Unavailable(format!("getsockname failed: {e}")))?;

        Ok(Self {
            stream,
            flow: InterceptedFlow {
                transport: Transport::Tcp,
                client,
                local,
                destination,
                control: None,
            },
            accepted_at: Instant::now(),
        })
    }

    #[must_use]
    pub const fn flow(&self) -> &InterceptedFlow {
        &self.flow
    }

    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.flow.client
    }

    #[must_use]
    pub const fn destination(&self) -> &AddressSpec {
        &self.flow.destination
    }

    /// When the listener accepted the connection
    #[must_use]
    pub const fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    #[must_use]
    pub fn into_parts(self) -> (TcpStream, InterceptedFlow) {
        (self.stream, self.flow)
    }
}

impl AsRawFd for TproxyConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// One datagram received on the TPROXY UDP listener
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub payload: Bytes,
    pub flow: InterceptedFlow,
}

impl UdpDatagram {
    /// Flow identity: (client, original destination)
    #[must_use]
    pub fn flow_key(&self) -> (SocketAddr, AddressSpec) {
        (self.flow.client, self.flow.destination.clone())
    }
}
