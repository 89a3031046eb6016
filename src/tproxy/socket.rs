//! TPROXY socket utilities
//!
//! This module provides low-level socket operations for TPROXY transparent proxying.
//! Key capabilities:
//! - `IP_TRANSPARENT` / `IPV6_TRANSPARENT`: bind to non-local addresses and
//!   receive TPROXY traffic
//! - `SO_ORIGINAL_DST` / `IP6T_SO_ORIGINAL_DST`: original destination of a
//!   redirected TCP connection
//! - `IP_RECVORIGDSTADDR` / `IPV6_RECVORIGDSTADDR`: original destination of
//!   UDP datagrams, delivered as ancillary data
//!
//! # Socket Provider Trait
//!
//! For testability, socket creation goes through the [`SocketProvider`] trait.
//! Production code uses [`RealSocketProvider`], while tests substitute
//! providers that skip the privileged options.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::TcpStream;
use tracing::debug;

use crate::address::{AddressSpec, Transport};
use crate::error::{RecoveryError, SocketError};

/// Linux kernel constant: `IP_TRANSPARENT` socket option (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux kernel constant: `IPV6_TRANSPARENT` socket option (`SOL_IPV6` level)
pub const IPV6_TRANSPARENT: libc::c_int = 75;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Linux kernel constant: `IP6T_SO_ORIGINAL_DST` (`SOL_IPV6` level)
pub const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// Linux kernel constant: `IP_RECVORIGDSTADDR` (`SOL_IP` level).
/// Also the cmsg type (`IP_ORIGDSTADDR`) of the record it enables.
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// Linux kernel constant: `IPV6_RECVORIGDSTADDR` (`SOL_IPV6` level).
/// Also the cmsg type (`IPV6_ORIGDSTADDR`) of the record it enables.
pub const IPV6_RECVORIGDSTADDR: libc::c_int = 74;

// =============================================================================
// Socket Provider Trait
// =============================================================================

/// Trait for abstracting socket creation for dependency injection and testing.
///
/// This trait allows production code to use real TPROXY sockets while tests
/// can substitute implementations that don't require `CAP_NET_ADMIN`.
pub trait SocketProvider: Send + Sync {
    /// Create an unbound, non-blocking socket ready for transparent use.
    ///
    /// The returned socket should have:
    /// - the family's transparency option enabled
    /// - `SO_REUSEADDR` enabled
    /// - for UDP, the receive-original-destination option enabled
    ///
    /// # Errors
    ///
    /// Returns `SocketError::PrivilegeDenied` if the transparency option is
    /// refused, and another `SocketError` for any other failure.
    fn transparent_socket(&self, domain: Domain, transport: Transport) -> Result<Socket, SocketError>;
}

/// Real socket provider that creates actual TPROXY sockets.
///
/// Requires the `CAP_NET_ADMIN` capability.
#[derive(Debug, Clone, Default)]
pub struct RealSocketProvider;

impl RealSocketProvider {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SocketProvider for RealSocketProvider {
    fn transparent_socket(&self, domain: Domain, transport: Transport) -> Result<Socket, SocketError> {
        let socket = new_socket(domain, transport)?;
        let ipv6 = domain == Domain::IPV6;

        socket
            .set_reuse_address(true)
            .map_err(|e| SocketError::option("SO_REUSEADDR", e))?;
        set_transparent(socket.as_raw_fd(), ipv6)?;
        if transport == Transport::Udp {
            set_recv_original_dst(socket.as_raw_fd(), ipv6)?;
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| SocketError::option("O_NONBLOCK", e))?;

        debug!(%transport, ipv6, "Created transparent socket");
        Ok(socket)
    }
}

/// Get the default socket provider (production implementation).
#[must_use]
pub fn default_socket_provider() -> Arc<dyn SocketProvider> {
    Arc::new(RealSocketProvider::new())
}

// =============================================================================
// Mock Socket Provider (for testing)
// =============================================================================

/// Mock socket provider for testing without `CAP_NET_ADMIN`.
///
/// Creates plain sockets with `SO_REUSEADDR` only.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockSocketProvider {
    /// Whether to simulate the transparency option being refused
    pub simulate_permission_denied: bool,
}

#[cfg(test)]
impl MockSocketProvider {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            simulate_permission_denied: false,
        }
    }

    /// Create a mock provider that simulates permission denied errors.
    #[must_use]
    pub const fn permission_denied() -> Self {
        Self {
            simulate_permission_denied: true,
        }
    }
}

#[cfg(test)]
impl SocketProvider for MockSocketProvider {
    fn transparent_socket(&self, domain: Domain, transport: Transport) -> Result<Socket, SocketError> {
        if self.simulate_permission_denied {
            return Err(SocketError::PrivilegeDenied);
        }

        let socket = new_socket(domain, transport)?;
        socket
            .set_reuse_address(true)
            .map_err(|e| SocketError::option("SO_REUSEADDR", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| SocketError::option("O_NONBLOCK", e))?;
        Ok(socket)
    }
}

// =============================================================================
// Socket options
// =============================================================================

fn new_socket(domain: Domain, transport: Transport) -> Result<Socket, SocketError> {
    let (ty, protocol) = match transport {
        Transport::Tcp => (Type::STREAM, Protocol::TCP),
        Transport::Udp => (Type::DGRAM, Protocol::UDP),
    };
    Socket::new(domain, ty, Some(protocol)).map_err(SocketError::Creation)
}

fn setsockopt_flag(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    label: &'static str,
) -> Result<(), SocketError> {
    let one: libc::c_int = 1;

    // SAFETY: `one` outlives the call and the length matches its type.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(SocketError::option(label, io::Error::last_os_error()));
    }
    Ok(())
}

/// Enable `IP_TRANSPARENT` (or `IPV6_TRANSPARENT` on IPv6 sockets).
///
/// # Errors
///
/// Returns `SocketError::PrivilegeDenied` on `EPERM`.
pub fn set_transparent(fd: RawFd, ipv6: bool) -> Result<(), SocketError> {
    if ipv6 {
        setsockopt_flag(fd, libc::SOL_IPV6, IPV6_TRANSPARENT, "IPV6_TRANSPARENT")
    } else {
        setsockopt_flag(fd, libc::SOL_IP, IP_TRANSPARENT, "IP_TRANSPARENT")
    }
}

/// Enable delivery of the original destination as ancillary data.
///
/// IPv6 sockets get both options so IPv4-mapped traffic on a dual-stack
/// socket is covered.
///
/// # Errors
///
/// Returns `SocketError::Option` if setsockopt fails.
pub fn set_recv_original_dst(fd: RawFd, ipv6: bool) -> Result<(), SocketError> {
    if ipv6 {
        setsockopt_flag(fd, libc::SOL_IPV6, IPV6_RECVORIGDSTADDR, "IPV6_RECVORIGDSTADDR")?;
        setsockopt_flag(fd, libc::SOL_IP, IP_RECVORIGDSTADDR, "IP_RECVORIGDSTADDR")
    } else {
        setsockopt_flag(fd, libc::SOL_IP, IP_RECVORIGDSTADDR, "IP_RECVORIGDSTADDR")
    }
}

/// Apply reuse-address, transparency and (for datagram sockets)
/// receive-original-destination options to an existing descriptor.
///
/// Returns the transport inferred from `SO_TYPE`.
///
/// # Errors
///
/// Returns `SocketError::UnsupportedType` for anything other than a stream
/// or datagram socket, and `SocketError::PrivilegeDenied` if transparency
/// is refused.
pub fn configure_transparent(fd: BorrowedFd<'_>) -> Result<Transport, SocketError> {
    let socket = SockRef::from(&fd);

    let ty = socket.r#type().map_err(|e| SocketError::option("SO_TYPE", e))?;
    let transport = if ty == Type::STREAM {
        Transport::Tcp
    } else if ty == Type::DGRAM {
        Transport::Udp
    } else {
        return Err(SocketError::UnsupportedType(libc::c_int::from(ty)));
    };

    let ipv6 = socket.domain().map_err(|e| SocketError::option("SO_DOMAIN", e))? == Domain::IPV6;

    socket
        .set_reuse_address(true)
        .map_err(|e| SocketError::option("SO_REUSEADDR", e))?;
    set_transparent(fd.as_raw_fd(), ipv6)?;
    if transport == Transport::Udp {
        set_recv_original_dst(fd.as_raw_fd(), ipv6)?;
    }

    debug!(%transport, ipv6, "Configured existing descriptor for TPROXY");
    Ok(transport)
}

// =============================================================================
// TCP destination recovery
// =============================================================================

/// Get the original destination address from a redirected IPv4 TCP connection.
///
/// # Errors
///
/// Returns `RecoveryError::Unavailable` if the socket carries no redirect
/// metadata (`ENOPROTOOPT`/`ENOENT`) or getsockopt fails for any other reason.
pub fn get_original_dst(fd: RawFd) -> Result<SocketAddr, RecoveryError> {
    // SAFETY: sockaddr_in is plain data; all-zero is a valid value.
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: addr and len are valid for writes of the advertised size.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if ret != 0 {
        return Err(unavailable("SO_ORIGINAL_DST", &io::Error::last_os_error()));
    }

    let port = u16::from_be(addr.sin_port);
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Get the original destination from a redirected IPv6 TCP connection.
///
/// # Errors
///
/// Returns `RecoveryError::Unavailable` if retrieval fails.
pub fn get_original_dst_v6(fd: RawFd) -> Result<SocketAddr, RecoveryError> {
    // SAFETY: sockaddr_in6 is plain data; all-zero is a valid value.
    let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;

    // SAFETY: addr and len are valid for writes of the advertised size.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            IP6T_SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if ret != 0 {
        return Err(unavailable("IP6T_SO_ORIGINAL_DST", &io::Error::last_os_error()));
    }

    let port = u16::from_be(addr.sin6_port);
    let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
    Ok(SocketAddr::V6(SocketAddrV6::new(
        ip,
        port,
        addr.sin6_flowinfo,
        addr.sin6_scope_id,
    )))
}

fn unavailable(option: &str, err: &io::Error) -> RecoveryError {
    match err.raw_os_error() {
        Some(libc::ENOPROTOOPT | libc::ENOENT) => {
            RecoveryError::Unavailable(format!("{option} not available - not a redirected connection?"))
        }
        _ => RecoveryError::Unavailable(format!("getsockopt {option} failed: {err}")),
    }
}

/// Recover the destination the client originally dialed.
///
/// The option level follows the connection's local address family; IPv4
/// clients on a dual-stack listener are queried at the IPv4 level.
///
/// # Errors
///
/// Returns `RecoveryError::Unavailable` if the connection was not redirected.
pub fn original_dst(stream: &TcpStream) -> Result<AddressSpec, RecoveryError> {
    let local = stream
        .local_addr()
        .map_err(|e| RecoveryError::Unavailable(format!("getsockname failed: {e}")))?;
    let fd = stream.as_raw_fd();

    let addr = match local {
        SocketAddr::V6(v6) if v6.ip().to_ipv4_mapped().is_none() => get_original_dst_v6(fd)?,
        _ => get_original_dst(fd)?,
    };
    Ok(AddressSpec::from(addr))
}

// =============================================================================
// Capability probes
// =============================================================================

/// Check if the current process has `CAP_NET_ADMIN` capability.
///
/// Probes by setting `IP_TRANSPARENT` on a throwaway socket.
#[must_use]
pub fn has_net_admin_capability() -> bool {
    !matches!(
        RealSocketProvider::new().transparent_socket(Domain::IPV4, Transport::Tcp),
        Err(SocketError::PrivilegeDenied)
    )
}

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}
