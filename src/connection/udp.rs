//! UDP flow dispatch
//!
//! UDP is connectionless, so flows are tracked by (client, original
//! destination). The first datagram of a flow opens a [`UdpTunnelSession`];
//! later ones are queued to it over a bounded channel. When the queue is full
//! the datagram is dropped, never blocking the listener.
//!
//! The flow table is owned by the dispatcher task. Sessions report their end
//! over a channel and the dispatcher reaps the entry, so a new flow for the
//! same key never races with the cleanup of the old one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, info_span, trace, Instrument};

use super::manager::ConnectionManager;
use crate::address::{AddressSpec, Transport};
use crate::error::ListenerError;
use crate::session::{run_tunnel, Tunnel, UdpTunnelSession};
use crate::tproxy::{InterceptedFlow, TproxyUdpListener, UdpDatagram, UDP_BUFFER_SIZE};

/// Flow identity: (client, original destination)
pub type FlowKey = (SocketAddr, AddressSpec);

/// Routes datagrams from the TPROXY UDP listener to per-flow sessions
pub struct UdpDispatcher {
    listener: TproxyUdpListener,
    manager: Arc<ConnectionManager>,
    flows: HashMap<FlowKey, mpsc::Sender<Bytes>>,
    channel_capacity: usize,
    closed_tx: mpsc::UnboundedSender<FlowKey>,
    closed_rx: mpsc::UnboundedReceiver<FlowKey>,
}

impl UdpDispatcher {
    #[must_use]
    pub fn new(listener: TproxyUdpListener, manager: Arc<ConnectionManager>, channel_capacity: usize) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            listener,
            manager,
            flows: HashMap::new(),
            channel_capacity: channel_capacity.max(1),
            closed_tx,
            closed_rx,
        }
    }

    /// Flows currently tracked
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Receive and dispatch until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the listener error that made the socket unusable.
    pub async fn run(mut self) -> Result<(), ListenerError> {
        info!("Starting UDP dispatcher on {}", self.listener.listen_addr());

        let mut shutdown_rx = self.manager.subscribe_shutdown();
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            if self.manager.is_shutting_down() {
                break;
            }

            tokio::select! {
                received = self.listener.recv(&mut buf) => match received {
                    Ok(datagram) => self.dispatch(datagram),
                    Err(e) if e.is_recoverable() => {
                        self.manager.stats().record_error(e.kind());
                        debug!(kind = %e.kind(), "Dropping UDP datagram: {}", e);
                        if let Some(pause) = e.backoff() {
                            tokio::time::sleep(pause).await;
                        }
                    }
                    Err(e) => return Err(e),
                },
                Some(key) = self.closed_rx.recv() => self.reap(&key),
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("UDP dispatcher stopping with {} flows", self.flows.len());
        self.flows.clear();
        Ok(())
    }

    fn dispatch(&mut self, datagram: UdpDatagram) {
        let UdpDatagram { payload, flow } = datagram;
        let key = (flow.client, flow.destination.clone());

        let payload = match self.flows.get(&key) {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    self.manager.stats().record_dropped_datagram();
                    trace!("UDP flow {} -> {} backlogged, dropping datagram", key.0, key.1);
                    return;
                }
                // Session already ended; open a fresh one
                Err(TrySendError::Closed(payload)) => {
                    self.flows.remove(&key);
                    payload
                }
            },
            None => payload,
        };

        self.open_flow(key, flow, payload);
    }

    fn open_flow(&mut self, key: FlowKey, flow: InterceptedFlow, first: Bytes) {
        let permit = match self.manager.admit(flow.client, Transport::Udp) {
            Ok(permit) => permit,
            Err(e) => {
                debug!("Dropping UDP flow {} -> {}: {}", key.0, key.1, e);
                return;
            }
        };

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        if tx.try_send(first).is_err() {
            return;
        }
        self.flows.insert(key.clone(), tx);

        let span = info_span!("udp_session", client = %flow.client, dst = %flow.destination);
        let ctx = self.manager.session_context().clone();
        let stats = Arc::clone(self.manager.stats());
        let closed_tx = self.closed_tx.clone();

        self.manager.spawn_guarded(
            permit,
            async move {
                let mut session = UdpTunnelSession::new(ctx, flow, rx);
                let outcome = run_tunnel(&mut session).await;
                match &outcome {
                    Ok(copied) => debug!(
                        "UDP flow closed via {}, {} up / {} down bytes",
                        session.key(),
                        copied.client_to_upstream,
                        copied.upstream_to_client
                    ),
                    Err(e) => debug!(kind = %e.kind(), state = %session.state(), "UDP flow failed: {}", e),
                }
                stats.record_outcome(session.state(), &outcome);
                let _ = closed_tx.send(key);
            }
            .instrument(span),
        );
    }

    /// Drop the entry for `key` if its session is gone
    fn reap(&mut self, key: &FlowKey) {
        if self.flows.get(key).is_some_and(mpsc::Sender::is_closed) {
            self.flows.remove(key);
            trace!("Reaped UDP flow {} -> {}", key.0, key.1);
        }
    }
}
