//! TPROXY UDP Listener
//!
//! UDP is connectionless: TPROXY delivers every redirected datagram to one
//! socket, and the original destination of each datagram arrives as
//! ancillary data (`IP_ORIGDSTADDR` / `IPV6_ORIGDSTADDR`). This listener reads
//! datagrams with `recvmsg(2)`, keeps the raw control bytes and parses the
//! destination out of them.
//!
//! # Required iptables
//!
//! ```bash
//! iptables -t mangle -A PREROUTING -p udp -j TPROXY \
//!     --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! ```
//!
//! Reply sockets bind to the original destination, which additionally needs
//! `net.ipv4.ip_nonlocal_bind = 1` (or `CAP_NET_ADMIN` with `IP_TRANSPARENT`).

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use socket2::Domain;
use tokio::net::UdpSocket;
use tracing::{info, trace};

use super::cmsg::parse_original_dst;
use super::flow::{InterceptedFlow, UdpDatagram};
use super::socket::{default_socket_provider, SocketProvider};
use crate::address::Transport;
use crate::config::ListenConfig;
use crate::error::{ListenerError, RecoveryError, SocketError};

/// Largest UDP payload
pub const UDP_BUFFER_SIZE: usize = 65535;

/// Control buffer size: room for both an IPv4 and an IPv6 destination record
const CMSG_BUFFER_SIZE: usize = 128;

/// Result of one `recvmsg(2)` call
#[derive(Debug)]
struct RecvMeta {
    len: usize,
    source: SocketAddr,
    control: Bytes,
    control_truncated: bool,
}

/// A TPROXY UDP listener that receives datagrams with original destination info
#[derive(Debug)]
pub struct TproxyUdpListener {
    socket: UdpSocket,
    listen_addr: SocketAddr,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl TproxyUdpListener {
    /// Create and bind a listener with real TPROXY sockets.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Socket` if socket setup or bind fails.
    pub fn bind(config: &ListenConfig) -> Result<Self, ListenerError> {
        Self::bind_with(config, default_socket_provider().as_ref())
    }

    /// Create and bind a listener through `provider`.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Socket` if socket setup or bind fails.
    pub fn bind_with(config: &ListenConfig, provider: &dyn SocketProvider) -> Result<Self, ListenerError> {
        info!("Creating TPROXY UDP listener on {}", config.address);

        let socket = provider.transparent_socket(Domain::for_address(config.address), Transport::Udp)?;

        if config.reuse_port {
            socket
                .set_reuse_port(true)
                .map_err(|e| SocketError::option("SO_REUSEPORT", e))?;
        }

        socket
            .bind(&config.address.into())
            .map_err(|source| SocketError::Bind {
                addr: config.address,
                source,
            })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(SocketError::Creation)?;
        let listen_addr = socket.local_addr().map_err(SocketError::Creation)?;

        info!("TPROXY UDP listener ready on {}", listen_addr);

        Ok(Self {
            socket,
            listen_addr,
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Receive one datagram with its original destination.
    ///
    /// # Errors
    ///
    /// - `ListenerError::Recv` if `recvmsg(2)` fails
    /// - `ListenerError::Recovery` if the destination record is missing,
    ///   malformed or the control data was truncated (`MSG_CTRUNC`); the
    ///   datagram is dropped and the listener stays usable
    pub async fn recv(&self, buf: &mut [u8]) -> Result<UdpDatagram, ListenerError> {
        // Loop on spurious readiness
        let meta = loop {
            self.socket.readable().await.map_err(ListenerError::Recv)?;

            match recv_with_control(self.socket.as_raw_fd(), buf) {
                Ok(meta) => break meta,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(ListenerError::Recv(e)),
            }
        };

        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(meta.len as u64, Ordering::Relaxed);

        if meta.control_truncated {
            return Err(RecoveryError::Malformed(
                "control message truncated (MSG_CTRUNC)".into(),
            )
            .into());
        }

        let destination = parse_original_dst(&meta.control)?;

        trace!(
            "UDP packet: {} -> {} ({} bytes)",
            meta.source,
            destination,
            meta.len
        );

        Ok(UdpDatagram {
            payload: Bytes::copy_from_slice(&buf[..meta.len]),
            flow: InterceptedFlow {
                transport: Transport::Udp,
                client: meta.source,
                local: self.listen_addr,
                destination,
                control: Some(meta.control),
            },
        })
    }

    /// Receive one datagram into a fresh maximum-size buffer
    ///
    /// # Errors
    ///
    /// See [`TproxyUdpListener::recv`].
    pub async fn recv_datagram(&self) -> Result<UdpDatagram, ListenerError> {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        self.recv(&mut buf).await
    }

    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Get the total number of packets received
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Get the total number of bytes received
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Builder for [`TproxyUdpListener`]
#[derive(Clone)]
pub struct TproxyUdpListenerBuilder {
    config: ListenConfig,
    provider: Arc<dyn SocketProvider>,
}

impl TproxyUdpListenerBuilder {
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            config: ListenConfig {
                address,
                tcp_enabled: false,
                ..ListenConfig::default()
            },
            provider: default_socket_provider(),
        }
    }

    #[must_use]
    pub fn reuse_port(mut self, reuse: bool) -> Self {
        self.config.reuse_port = reuse;
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn SocketProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// # Errors
    ///
    /// See [`TproxyUdpListener::bind_with`].
    pub fn build(self) -> Result<TproxyUdpListener, ListenerError> {
        TproxyUdpListener::bind_with(&self.config, self.provider.as_ref())
    }
}

/// Call `recvmsg(2)` once, returning the payload length, the source address
/// and a copy of the control buffer.
#[allow(clippy::cast_sign_loss)] // n is non-negative after the error check
fn recv_with_control(fd: RawFd, buf: &mut [u8]) -> io::Result<RecvMeta> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    // SAFETY: sockaddr_storage and msghdr are plain data; all-zero is valid.
    let mut src: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = CMSG_BUFFER_SIZE as _;

    // SAFETY: every pointer in msg refers to a live local buffer of the advertised size.
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let source = sockaddr_to_std(&src, msg.msg_namelen).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "unsupported source address family")
    })?;

    #[allow(clippy::unnecessary_cast)] // size_t on glibc, socklen_t on musl
    let control_len = (msg.msg_controllen as usize).min(CMSG_BUFFER_SIZE);

    Ok(RecvMeta {
        len: n as usize,
        source,
        control: Bytes::copy_from_slice(&cmsg_buf[..control_len]),
        control_truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
    })
}

/// Convert a kernel-filled `sockaddr_storage` into a [`SocketAddr`]
fn sockaddr_to_std(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    let len = len as usize;
    match i32::from(storage.ss_family) {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: family is AF_INET, so the storage holds a sockaddr_in.
            let addr = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port))))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: family is AF_INET6, so the storage holds a sockaddr_in6.
            let addr = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
