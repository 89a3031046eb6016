//! TCP tunnel session

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout_at;
use tracing::{debug, trace};

use super::{deadline_after, SessionContext, SessionCore, SessionKey, Tunnel, Upstream};
use crate::address::Transport;
use crate::error::{NegotiationError, TunnelError};
use crate::io::{bidirectional_copy_with_buffer, CopyResult};
use crate::socks5::{NegotiationState, Socks5Negotiator};
use crate::tproxy::InterceptedFlow;

/// One intercepted TCP connection and its upstream
#[derive(Debug)]
pub struct TcpTunnelSession {
    core: SessionCore,
    ctx: SessionContext,
    upstream: Upstream,
    client: Option<TcpStream>,
    remote: Option<TcpStream>,
}

impl TcpTunnelSession {
    /// The upstream strategy is fixed here: SOCKS5 CONNECT when a proxy is
    /// configured, otherwise a direct transparent dial.
    #[must_use]
    pub fn new(ctx: SessionContext, client: TcpStream, flow: InterceptedFlow) -> Self {
        let upstream = ctx.upstream();
        Self {
            core: SessionCore::new(upstream.key(Transport::Tcp), flow),
            ctx,
            upstream,
            client: Some(client),
            remote: None,
        }
    }

    #[must_use]
    pub const fn flow(&self) -> &InterceptedFlow {
        &self.core.flow
    }

    async fn establish(&mut self) -> Result<TcpStream, TunnelError> {
        let deadline = deadline_after(self.ctx.negotiation_timeout);
        let destination = self.core.remote().clone();

        let target = match &self.upstream {
            Upstream::Socks5(proxy) => proxy.address,
            Upstream::Direct => destination.to_socket_addr().ok_or_else(|| {
                NegotiationError::AddressInvalid(format!("cannot dial {destination} directly"))
            })?,
        };
        let local = self.ctx.bind_addr(self.core.flow.client, target);

        let mut stream = timeout_at(deadline, self.ctx.dialer.dial_tcp(local, target))
            .await
            .map_err(|_| NegotiationError::NegotiationTimeout {
                state: NegotiationState::Init,
            })??;
        trace!(%local, %target, "Upstream dialed");

        if let Upstream::Socks5(proxy) = &self.upstream {
            let mut negotiator = Socks5Negotiator::new(proxy.credential()).with_deadline(deadline);
            let result = negotiator.connect(&mut stream, &destination).await;
            self.core.state = negotiator.state();
            result?;
        }

        Ok(stream)
    }
}

#[async_trait]
impl Tunnel for TcpTunnelSession {
    fn key(&self) -> &SessionKey {
        &self.core.key
    }

    fn state(&self) -> NegotiationState {
        self.core.state
    }

    async fn negotiate(&mut self) -> Result<(), TunnelError> {
        match self.establish().await {
            Ok(stream) => {
                self.remote = Some(stream);
                self.core.state = NegotiationState::Established;
                debug!(
                    client = %self.core.flow.client,
                    destination = %self.core.flow.destination,
                    key = %self.core.key,
                    "TCP tunnel established"
                );
                Ok(())
            }
            Err(e) => {
                self.core.fail();
                self.client = None;
                self.remote = None;
                Err(e)
            }
        }
    }

    async fn relay(&mut self) -> Result<CopyResult, TunnelError> {
        let (Some(client), Some(remote)) = (self.client.as_mut(), self.remote.as_mut()) else {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("session is {}", self.core.state),
            )));
        };

        let result = bidirectional_copy_with_buffer(client, remote, self.ctx.buffer_size).await?;
        trace!(
            up = result.client_to_upstream,
            down = result.upstream_to_client,
            "TCP relay finished"
        );
        Ok(result)
    }

    async fn close(&mut self) {
        self.client = None;
        self.remote = None;
        if self.core.state != NegotiationState::Established {
            self.core.fail();
        }
    }
}
