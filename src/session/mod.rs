//! Tunnel sessions
//!
//! A session owns one intercepted flow and its upstream side. It is driven
//! through the [`Tunnel`] trait: `negotiate` reaches the upstream (through
//! the transparent dialer, then SOCKS5 unless running direct), `relay` moves
//! application data once `Established`, and `close` releases both sides.
//!
//! The variant is picked once at construction from the transport of the
//! flow and whether an upstream proxy is configured:
//!
//! | transport | upstream | variant |
//! |-----------|----------|---------|
//! | TCP | SOCKS5 | CONNECT to the original destination |
//! | TCP | none | transparent dial straight to the destination |
//! | UDP | SOCKS5 | UDP ASSOCIATE, datagrams wrapped in relay envelopes |
//! | UDP | none | transparent UDP socket to the destination |

mod tcp;
mod udp;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::address::{AddressSpec, Transport};
use crate::config::{Config, ProxyConfig};
use crate::error::TunnelError;
use crate::io::CopyResult;
use crate::socks5::NegotiationState;
use crate::tproxy::{InterceptedFlow, TransparentDialer};

pub use tcp::TcpTunnelSession;
pub use udp::UdpTunnelSession;

/// Upstream protocol of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    Socks5,
    /// Bypass: no proxy, dial the destination directly
    Direct,
}

impl fmt::Display for UpstreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks5 => f.write_str("socks5"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

/// Identifies which proxy variant handles a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    pub transport: Transport,
    pub protocol: UpstreamProtocol,
    /// Upstream scope label (`"direct"` when bypassing)
    pub scope: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.transport, self.protocol, self.scope)
    }
}

/// Upstream strategy chosen at construction
#[derive(Debug, Clone)]
pub(crate) enum Upstream {
    Socks5(Arc<ProxyConfig>),
    Direct,
}

impl Upstream {
    fn key(&self, transport: Transport) -> SessionKey {
        match self {
            Self::Socks5(proxy) => SessionKey {
                transport,
                protocol: UpstreamProtocol::Socks5,
                scope: proxy.scope.clone(),
            },
            Self::Direct => SessionKey {
                transport,
                protocol: UpstreamProtocol::Direct,
                scope: "direct".into(),
            },
        }
    }
}

/// Shared, read-only inputs of every session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub dialer: TransparentDialer,
    /// `None` runs every flow direct
    pub upstream: Option<Arc<ProxyConfig>>,
    /// Deadline for dial plus negotiation
    pub negotiation_timeout: Duration,
    /// UDP flows end after this much silence
    pub udp_idle_timeout: Duration,
    /// Bind upstream sockets to the client's IP
    pub spoof_source: bool,
    /// Relay buffer size
    pub buffer_size: usize,
}

impl SessionContext {
    #[must_use]
    pub fn from_config(config: &Config, dialer: TransparentDialer) -> Self {
        Self {
            dialer,
            upstream: config.upstream.clone().map(Arc::new),
            negotiation_timeout: config.session.negotiation_timeout(),
            udp_idle_timeout: config.session.udp_idle_timeout(),
            spoof_source: config.session.spoof_source,
            buffer_size: config.connection.buffer_size,
        }
    }

    pub(crate) fn upstream(&self) -> Upstream {
        self.upstream
            .as_ref()
            .map_or(Upstream::Direct, |proxy| Upstream::Socks5(Arc::clone(proxy)))
    }

    /// Local address for an upstream socket towards `target`.
    ///
    /// With source spoofing the client's IP is used as-is, so an IPv4 client
    /// with an IPv6 target fails in the dialer with `AddressFamilyMismatch`.
    #[must_use]
    pub fn bind_addr(&self, client: SocketAddr, target: SocketAddr) -> SocketAddr {
        if self.spoof_source {
            return SocketAddr::new(client.ip(), 0);
        }
        let ip = if target.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, 0)
    }
}

/// Bookkeeping shared by every session variant
#[derive(Debug)]
pub(crate) struct SessionCore {
    key: SessionKey,
    flow: InterceptedFlow,
    state: NegotiationState,
}

impl SessionCore {
    fn new(key: SessionKey, flow: InterceptedFlow) -> Self {
        Self {
            key,
            flow,
            state: NegotiationState::Init,
        }
    }

    fn remote(&self) -> &AddressSpec {
        &self.flow.destination
    }

    fn fail(&mut self) {
        self.state = NegotiationState::Failed;
    }
}

/// A tunnel session: one client flow, one upstream
#[async_trait]
pub trait Tunnel: Send {
    fn key(&self) -> &SessionKey;

    /// Current negotiation state
    fn state(&self) -> NegotiationState;

    /// Reach the upstream and complete its handshake.
    ///
    /// Ends in `Established` on success. On failure the state is `Failed`
    /// and both sides are released.
    async fn negotiate(&mut self) -> Result<(), TunnelError>;

    /// Relay application data until either side finishes or fails
    async fn relay(&mut self) -> Result<CopyResult, TunnelError>;

    /// Release both sides
    async fn close(&mut self);
}

/// Negotiate, relay and close a session, in that order.
///
/// # Errors
///
/// Returns the negotiation or relay error; both sides are closed either way.
pub async fn run_tunnel<T>(tunnel: &mut T) -> Result<CopyResult, TunnelError>
where
    T: Tunnel + ?Sized,
{
    if let Err(e) = tunnel.negotiate().await {
        tunnel.close().await;
        return Err(e);
    }
    debug!(key = %tunnel.key(), "Session established");

    let result = tunnel.relay().await;
    tunnel.close().await;
    result
}

/// Roughly 30 years; stands in for deadlines that would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}
