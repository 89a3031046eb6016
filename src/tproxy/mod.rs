//! TPROXY transparent proxy support
//!
//! Linux-only plumbing for intercepted traffic:
//!
//! - [`socket`]: transparency options, TCP original-destination recovery and
//!   the [`SocketProvider`] seam
//! - [`cmsg`]: original-destination parsing for UDP ancillary data
//! - [`dialer`]: outbound sockets bound to non-local addresses
//! - [`listener`] / [`udp_listener`]: accept redirected flows
//!
//! # Requirements
//!
//! - `CAP_NET_ADMIN` (or root) for `IP_TRANSPARENT`
//! - mangle-table TPROXY rules plus a policy route sending marked packets
//!   to `lo`

pub mod cmsg;
pub mod dialer;
pub mod flow;
pub mod listener;
pub mod socket;
pub mod udp_listener;

pub use cmsg::parse_original_dst;
pub use dialer::{DialedSocket, Endpoint, TransparentDialer};
pub use flow::{InterceptedFlow, TproxyConnection, UdpDatagram};
pub use listener::{TproxyListener, TproxyListenerBuilder};
pub use socket::{
    configure_transparent, default_socket_provider, get_original_dst, get_original_dst_v6,
    has_net_admin_capability, is_root, original_dst, set_recv_original_dst, set_transparent,
    RealSocketProvider, SocketProvider, IP6T_SO_ORIGINAL_DST, IPV6_RECVORIGDSTADDR,
    IPV6_TRANSPARENT, IP_RECVORIGDSTADDR, IP_TRANSPARENT, SO_ORIGINAL_DST,
};
pub use udp_listener::{TproxyUdpListener, TproxyUdpListenerBuilder, UDP_BUFFER_SIZE};

#[cfg(test)]
pub use socket::MockSocketProvider;
