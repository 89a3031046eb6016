//! TCP connection handling
//!
//! Runs one accepted TPROXY connection through a [`TcpTunnelSession`] and
//! reports how it ended.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, Instrument};

use super::stats::ConnectionStats;
use crate::address::AddressSpec;
use crate::error::TunnelError;
use crate::io::CopyResult;
use crate::session::{run_tunnel, SessionContext, SessionKey, TcpTunnelSession, Tunnel};
use crate::socks5::NegotiationState;
use crate::tproxy::TproxyConnection;

/// Result of handling a TCP connection
#[derive(Debug)]
pub struct TcpConnectionResult {
    pub client_addr: SocketAddr,
    pub destination: AddressSpec,
    /// Proxy variant that handled the connection
    pub key: SessionKey,
    /// Final negotiation state
    pub state: NegotiationState,
    /// Time from accept to teardown
    pub duration: Duration,
    pub outcome: Result<CopyResult, TunnelError>,
}

/// Negotiate and relay one TCP connection
pub async fn handle_tcp_connection(conn: TproxyConnection, ctx: SessionContext) -> TcpConnectionResult {
    let accepted_at = conn.accepted_at();
    let (stream, flow) = conn.into_parts();
    let client_addr = flow.client;
    let destination = flow.destination.clone();

    let mut session = TcpTunnelSession::new(ctx, stream, flow);
    let outcome = run_tunnel(&mut session).await;
    let duration = accepted_at.elapsed();

    match &outcome {
        Ok(copied) => info!(
            ?duration,
            "Connection closed: {} -> {} via {}, {} up / {} down bytes",
            client_addr,
            destination,
            session.key(),
            copied.client_to_upstream,
            copied.upstream_to_client
        ),
        Err(e) => debug!(
            kind = %e.kind(),
            state = %session.state(),
            ?duration,
            "Connection failed: {} -> {}: {}",
            client_addr,
            destination,
            e
        ),
    }

    TcpConnectionResult {
        client_addr,
        destination,
        key: session.key().clone(),
        state: session.state(),
        duration,
        outcome,
    }
}

/// Session task for an accepted connection, instrumented and counted in `stats`
pub fn tcp_handler(
    conn: TproxyConnection,
    ctx: SessionContext,
    stats: Arc<ConnectionStats>,
) -> impl Future<Output = ()> + Send + 'static {
    let span = info_span!(
        "tcp_session",
        client = %conn.client_addr(),
        dst = %conn.destination(),
    );

    async move {
        let result = handle_tcp_connection(conn, ctx).await;
        stats.record_outcome(result.state, &result.outcome);
    }
    .instrument(span)
}
