//! TPROXY TCP listener
//!
//! Accepts redirected TCP connections and recovers the original destination
//! of each one before handing it out.
//!
//! # Required iptables
//!
//! ```bash
//! iptables -t mangle -A PREROUTING -p tcp -j TPROXY \
//!     --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::Domain;
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::flow::TproxyConnection;
use super::socket::{default_socket_provider, SocketProvider};
use crate::address::Transport;
use crate::config::ListenConfig;
use crate::error::{ListenerError, SocketError};

/// A TPROXY TCP listener
#[derive(Debug)]
pub struct TproxyListener {
    listener: TcpListener,
    listen_addr: SocketAddr,
}

impl TproxyListener {
    /// Create and bind a listener with real TPROXY sockets.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Socket` if socket setup, bind or listen fails.
    pub fn bind(config: &ListenConfig) -> Result<Self, ListenerError> {
        Self::bind_with(config, default_socket_provider().as_ref())
    }

    /// Create and bind a listener through `provider`.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Socket` if socket setup, bind or listen fails.
    pub fn bind_with(config: &ListenConfig, provider: &dyn SocketProvider) -> Result<Self, ListenerError> {
        info!("Creating TPROXY TCP listener on {}", config.address);

        let domain = Domain::for_address(config.address);
        let socket = provider.transparent_socket(domain, Transport::Tcp)?;

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

        let backlog = i32::try_from(config.tcp_backlog).unwrap_or(i32::MAX);
        socket
            .listen(backlog)
            .map_err(|e| SocketError::option("listen", e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener).map_err(SocketError::Creation)?;
        let listen_addr = listener.local_addr().map_err(SocketError::Creation)?;

        info!(
            "TPROXY TCP listener ready on {} (backlog={})",
            listen_addr, config.tcp_backlog
        );

        Ok(Self {
            listener,
            listen_addr,
        })
    }

    /// Accept a connection and recover its original destination.
    ///
    /// # Errors
    ///
    /// - `ListenerError::Accept` if `accept(2)` fails
    /// - `ListenerError::Recovery` if the destination cannot be recovered;
    ///   the connection is closed and the listener stays usable
    pub async fn accept(&self) -> Result<TproxyConnection, ListenerError> {
        let (stream, client_addr) = self
            .listener
            .accept()
            .await
            .map_err(ListenerError::Accept)?;

        debug!("Accepted connection from {}", client_addr);

        Ok(TproxyConnection::new(stream, client_addr)?)
    }

    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

/// Builder for [`TproxyListener`]
#[derive(Clone)]
pub struct TproxyListenerBuilder {
    config: ListenConfig,
    provider: Arc<dyn SocketProvider>,
}

impl TproxyListenerBuilder {
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            config: ListenConfig {
                address,
                udp_enabled: false,
                ..ListenConfig::default()
            },
            provider: default_socket_provider(),
        }
    }

    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.tcp_backlog = backlog;
        self
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
    /// See [`TproxyListener::bind_with`].
    pub fn build(self) -> Result<TproxyListener, ListenerError> {
        TproxyListener::bind_with(&self.config, self.provider.as_ref())
    }
}
