//! UDP tunnel session
//!
//! Client datagrams arrive over a channel fed by the UDP dispatcher. Replies
//! go back through a socket bound to the original destination and connected
//! to the client, so the client sees them coming from the address it wrote to.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at};
use tracing::{debug, trace, warn};

use super::{deadline_after, SessionContext, SessionCore, SessionKey, Tunnel, Upstream};
use crate::address::{AddressSpec, Transport};
use crate::error::{NegotiationError, TunnelError};
use crate::io::CopyResult;
use crate::socks5::{NegotiationState, RelayPacket, Socks5Negotiator};
use crate::tproxy::InterceptedFlow;

/// One (client, original destination) UDP flow and its upstream
#[derive(Debug)]
pub struct UdpTunnelSession {
    core: SessionCore,
    ctx: SessionContext,
    upstream: Upstream,
    inbound: mpsc::Receiver<Bytes>,
    /// SOCKS5 control connection; the association lives as long as it does
    control: Option<TcpStream>,
    relay: Option<UdpSocket>,
    reply: Option<UdpSocket>,
}

impl UdpTunnelSession {
    #[must_use]
    pub fn new(ctx: SessionContext, flow: InterceptedFlow, inbound: mpsc::Receiver<Bytes>) -> Self {
        let upstream = ctx.upstream();
        Self {
            core: SessionCore::new(upstream.key(Transport::Udp), flow),
            ctx,
            upstream,
            inbound,
            control: None,
            relay: None,
            reply: None,
        }
    }

    #[must_use]
    pub const fn flow(&self) -> &InterceptedFlow {
        &self.core.flow
    }

    /// UDP relay endpoint the upstream association sends through
    #[must_use]
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay.as_ref().and_then(|s| s.peer_addr().ok())
    }

    async fn establish(&mut self) -> Result<(), TunnelError> {
        let deadline = deadline_after(self.ctx.negotiation_timeout);
        let client = self.core.flow.client;
        let destination = self.core.remote().to_socket_addr().ok_or_else(|| {
            NegotiationError::AddressInvalid(format!("{} is not a literal address", self.core.remote()))
        })?;

        let relay_target = match &self.upstream {
            Upstream::Socks5(proxy) => {
                let local = self.ctx.bind_addr(client, proxy.address);
                let mut control = timeout_at(deadline, self.ctx.dialer.dial_tcp(local, proxy.address))
                    .await
                    .map_err(|_| NegotiationError::NegotiationTimeout {
                        state: NegotiationState::Init,
                    })??;

                let mut negotiator = Socks5Negotiator::new(proxy.credential()).with_deadline(deadline);
                let bound = negotiator.udp_associate(&mut control).await;
                self.core.state = negotiator.state();
                let bound = bound?;

                let target = timeout_at(deadline, relay_endpoint(bound, proxy.address))
                    .await
                    .map_err(|_| NegotiationError::NegotiationTimeout {
                        state: NegotiationState::ConnectSent,
                    })??;
                trace!(relay = %target, "UDP association established");
                self.control = Some(control);
                target
            }
            Upstream::Direct => destination,
        };

        let local = self.ctx.bind_addr(client, relay_target);
        self.relay = Some(self.ctx.dialer.dial_udp(local, relay_target)?);
        self.reply = Some(self.ctx.dialer.dial_udp(destination, client)?);
        Ok(())
    }

    /// Unwrap an upstream datagram into the payload for the client
    fn unwrap_reply(&self, datagram: &[u8]) -> Option<Bytes> {
        match self.upstream {
            Upstream::Direct => Some(Bytes::copy_from_slice(datagram)),
            Upstream::Socks5(_) => match RelayPacket::decode(Bytes::copy_from_slice(datagram)) {
                Ok(packet) => {
                    trace!(source = %packet.address, len = packet.payload.len(), "Relay reply");
                    Some(packet.payload)
                }
                Err(e) => {
                    warn!(client = %self.core.flow.client, error = %e, "Dropping relay datagram");
                    None
                }
            },
        }
    }
}

#[async_trait]
impl Tunnel for UdpTunnelSession {
    fn key(&self) -> &SessionKey {
        &self.core.key
    }

    fn state(&self) -> NegotiationState {
        self.core.state
    }

    async fn negotiate(&mut self) -> Result<(), TunnelError> {
        match self.establish().await {
            Ok(()) => {
                self.core.state = NegotiationState::Established;
                debug!(
                    client = %self.core.flow.client,
                    destination = %self.core.flow.destination,
                    key = %self.core.key,
                    "UDP tunnel established"
                );
                Ok(())
            }
            Err(e) => {
                self.core.fail();
                self.close().await;
                Err(e)
            }
        }
    }

    async fn relay(&mut self) -> Result<CopyResult, TunnelError> {
        let (Some(relay), Some(reply)) = (self.relay.as_ref(), self.reply.as_ref()) else {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("session is {}", self.core.state),
            )));
        };

        let idle = self.ctx.udp_idle_timeout;
        let mut idle_deadline = deadline_after(idle);
        let mut buf = vec![0u8; self.ctx.buffer_size];
        let mut result = CopyResult::default();

        loop {
            tokio::select! {
                payload = self.inbound.recv() => {
                    let Some(payload) = payload else {
                        trace!("UDP dispatcher closed the flow");
                        break;
                    };
                    match &self.upstream {
                        Upstream::Socks5(_) => {
                            let frame = RelayPacket::new(self.core.flow.destination.clone(), payload.clone())
                                .encode(Transport::Udp)?;
                            relay.send(&frame).await?;
                        }
                        Upstream::Direct => {
                            relay.send(&payload).await?;
                        }
                    }
                    result.client_to_upstream += payload.len() as u64;
                }
                received = relay.recv(&mut buf) => {
                    let n = received?;
                    let Some(payload) = self.unwrap_reply(&buf[..n]) else {
                        continue;
                    };
                    reply.send(&payload).await?;
                    result.upstream_to_client += payload.len() as u64;
                }
                () = control_closed(self.control.as_mut()) => {
                    debug!(client = %self.core.flow.client, "SOCKS5 control connection closed");
                    break;
                }
                () = sleep_until(idle_deadline) => {
                    debug!(client = %self.core.flow.client, idle = ?idle, "UDP flow idle");
                    break;
                }
            }
            idle_deadline = deadline_after(idle);
        }

        Ok(result)
    }

    async fn close(&mut self) {
        self.inbound.close();
        self.control = None;
        self.relay = None;
        self.reply = None;
        if self.core.state != NegotiationState::Established {
            self.core.fail();
        }
    }
}

/// Resolve the address a UDP ASSOCIATE reply bound.
///
/// An unspecified IP means "same host as the proxy"; a domain is resolved
/// and must yield an address of the proxy's family.
async fn relay_endpoint(bound: AddressSpec, proxy: SocketAddr) -> Result<SocketAddr, NegotiationError> {
    match bound {
        AddressSpec::Domain(name, port) => lookup_host((name.as_str(), port))
            .await
            .map_err(|e| NegotiationError::AddressInvalid(format!("cannot resolve relay {name}: {e}")))?
            .find(|addr| addr.is_ipv4() == proxy.is_ipv4())
            .ok_or_else(|| NegotiationError::AddressInvalid(format!("relay {name} has no usable address"))),
        literal => {
            let addr = literal
                .to_socket_addr()
                .ok_or_else(|| NegotiationError::AddressInvalid(literal.to_string()))?;
            if addr.ip().is_unspecified() {
                Ok(SocketAddr::new(proxy.ip(), addr.port()))
            } else {
                Ok(addr)
            }
        }
    }
}

/// Completes once the control connection reaches EOF or fails
async fn control_closed(control: Option<&mut TcpStream>) {
    let Some(stream) = control else {
        return std::future::pending().await;
    };
    let mut probe = [0u8; 64];
    loop {
        match stream.read(&mut probe).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
