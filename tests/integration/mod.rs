//! Integration tests for tproxy-tunnel
//!
//! These drive the public API end to end against mock SOCKS5 servers.
//!
//! # Test Organization
//!
//! - `socks5_negotiation`: negotiator against a mock server over real TCP
//! - `session_concurrency`: many TCP sessions through the connection manager
//! - `udp_relay`: UDP ASSOCIATE sessions against a mock relay
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests
//! cargo test --test integration_tests udp
//! ```
//!
//! # Test Requirements
//!
//! No privileges needed: sockets come from [`PlainSocketProvider`], which
//! skips the transparency option. Real TPROXY interception needs
//! `CAP_NET_ADMIN` and iptables rules and is not exercised here.

pub mod mock_socks5;
pub mod session_concurrency;
pub mod socks5_negotiation;
pub mod udp_relay;

use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use tproxy_tunnel::address::Transport;
use tproxy_tunnel::config::ProxyConfig;
use tproxy_tunnel::error::SocketError;
use tproxy_tunnel::session::SessionContext;
use tproxy_tunnel::tproxy::{SocketProvider, TransparentDialer};

/// Socket provider for unprivileged tests: no transparency option
#[derive(Debug, Default)]
pub struct PlainSocketProvider;

impl SocketProvider for PlainSocketProvider {
    fn transparent_socket(&self, domain: Domain, transport: Transport) -> Result<Socket, SocketError> {
        let ty = match transport {
            Transport::Tcp => Type::STREAM,
            Transport::Udp => Type::DGRAM,
        };
        let socket = Socket::new(domain, ty, None).map_err(SocketError::Creation)?;
        socket
            .set_reuse_address(true)
            .map_err(|e| SocketError::option("SO_REUSEADDR", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| SocketError::option("O_NONBLOCK", e))?;
        Ok(socket)
    }
}

pub fn plain_dialer() -> TransparentDialer {
    TransparentDialer::new(Arc::new(PlainSocketProvider))
}

pub fn session_context(upstream: Option<ProxyConfig>) -> SessionContext {
    SessionContext {
        dialer: plain_dialer(),
        upstream: upstream.map(Arc::new),
        negotiation_timeout: Duration::from_secs(5),
        udp_idle_timeout: Duration::from_secs(5),
        spoof_source: false,
        buffer_size: 16 * 1024,
    }
}
