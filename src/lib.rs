//! tproxy-tunnel: Linux transparent proxy data path
//!
//! Intercepts TCP connections and UDP datagrams redirected by the kernel's
//! TPROXY target, recovers where each flow was originally headed, and carries
//! it to an upstream SOCKS5 proxy (or straight to the destination).
//!
//! # Features
//!
//! - **Destination Recovery**: `SO_ORIGINAL_DST` for TCP, `IP_ORIGDSTADDR`
//!   ancillary data for UDP, IPv4 and IPv6
//! - **Transparent Dialing**: outbound sockets bound to non-local addresses
//!   (`IP_TRANSPARENT`), optionally spoofing the client's source IP
//! - **SOCKS5 Client**: greeting, username/password auth, CONNECT and
//!   UDP ASSOCIATE under one deadline
//! - **UDP Relay Framing**: RFC 1928 datagram envelopes
//! - **Connection Management**: Backpressure, statistics, and graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! Client → iptables TPROXY → listener ──recover dst──▶ session
//!                                                        │ transparent dial
//!                                                        ▼
//!                                       SOCKS5 proxy (or destination)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tproxy_tunnel::config::load_config;
//! use tproxy_tunnel::connection::{run_accept_loop, ConnectionManager};
//! use tproxy_tunnel::session::SessionContext;
//! use tproxy_tunnel::tproxy::{TproxyListener, TransparentDialer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tproxy-tunnel/config.json")?;
//!
//! let session = SessionContext::from_config(&config, TransparentDialer::default());
//! let manager = Arc::new(ConnectionManager::new(&config.connection, session));
//!
//! let listener = TproxyListener::bind(&config.listen)?;
//! run_accept_loop(listener, manager).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`address`]: Destination addresses and their SOCKS5 encoding
//! - [`config`]: Configuration types and loading
//! - [`connection`]: Admission, accept loops, UDP dispatch and statistics
//! - [`error`]: Error types
//! - [`io`]: Bidirectional copy
//! - [`session`]: Tunnel sessions
//! - [`socks5`]: SOCKS5 negotiation and UDP framing
//! - [`tproxy`]: TPROXY sockets, destination recovery, listeners and dialer

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod address;
pub mod config;
pub mod connection;
pub mod error;
pub mod io;
pub mod session;
pub mod socks5;
pub mod tproxy;

// Re-export commonly used types at the crate root
pub use address::{AddressSpec, Transport};
pub use config::{AuthCredential, Config, ListenConfig, ProxyConfig};
pub use connection::{ConnectionManager, ConnectionStats, UdpDispatcher};
pub use error::{
    ConfigError, ConnectionError, ErrorKind, FramingError, ListenerError, NegotiationError,
    RecoveryError, SocketError, TunnelError,
};
pub use session::{SessionContext, SessionKey, TcpTunnelSession, Tunnel, UdpTunnelSession};
pub use socks5::{NegotiationState, RelayPacket, Socks5Negotiator};
pub use tproxy::{TproxyConnection, TproxyListener, TproxyUdpListener, TransparentDialer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with the capability transparent sockets need
///
/// # Errors
///
/// Returns `SocketError::PrivilegeDenied` without `CAP_NET_ADMIN`.
pub fn check_capabilities() -> Result<(), SocketError> {
    if !tproxy::has_net_admin_capability() {
        return Err(SocketError::PrivilegeDenied);
    }
    Ok(())
}
