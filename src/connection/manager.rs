//! Admission and lifecycle for tunnel sessions
//!
//! Every TCP connection and UDP flow holds one semaphore permit for as long
//! as its session runs. Shutdown closes admission, waits for the permits to
//! come back, and aborts the sessions that outlive the drain timeout.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::stats::{ConnectionStats, StatsSnapshot};
use super::tcp::tcp_handler;
use crate::address::Transport;
use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ListenerError};
use crate::session::SessionContext;
use crate::tproxy::{TproxyConnection, TproxyListener};

/// Owns the session slots, shared statistics and shutdown signals
pub struct ConnectionManager {
    slots: Arc<Semaphore>,
    capacity: usize,
    stats: Arc<ConnectionStats>,
    session: SessionContext,
    drain_timeout: Duration,
    /// Fires once when shutdown starts; accept loops listen on it
    stop: broadcast::Sender<()>,
    /// Fires when the drain timeout expires with sessions still running
    abort: broadcast::Sender<()>,
    closing: AtomicBool,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: &ConnectionConfig, session: SessionContext) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_connections)),
            capacity: config.max_connections,
            stats: Arc::new(ConnectionStats::new()),
            session,
            drain_timeout: config.drain_timeout(),
            stop: broadcast::channel(1).0,
            abort: broadcast::channel(1).0,
            closing: AtomicBool::new(false),
        }
    }

    /// Take a slot for a new `transport` session from `client`.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once shutdown has started, `LimitReached` when every
    /// slot is taken. Only the latter is counted as a rejection.
    pub fn admit(
        &self,
        client: SocketAddr,
        transport: Transport,
    ) -> Result<OwnedSemaphorePermit, ConnectionError> {
        if self.is_shutting_down() {
            return Err(ConnectionError::ShuttingDown);
        }

        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => {
                self.stats.record_accepted(transport);
                debug!(
                    %client, %transport,
                    active = self.active_connections(),
                    max = self.capacity,
                    "Session admitted"
                );
                Ok(permit)
            }
            Err(_) => {
                self.stats.record_rejected();
                let current = self.active_connections();
                warn!(%client, %transport, current, max = self.capacity, "Session limit reached");
                Err(ConnectionError::LimitReached {
                    current,
                    max: self.capacity,
                })
            }
        }
    }

    /// Spawn `task`, releasing `permit` when it finishes or is aborted at
    /// the end of the drain.
    pub fn spawn_guarded<F>(&self, permit: OwnedSemaphorePermit, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut aborted = self.abort.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = task => {}
                Ok(()) = aborted.recv() => debug!("Session aborted at end of drain"),
            }
            drop(permit);
        })
    }

    /// Admit and spawn the session for an accepted TCP connection.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::admit`]. The connection is dropped on error.
    pub fn handle_connection(&self, conn: TproxyConnection) -> Result<JoinHandle<()>, ConnectionError> {
        let permit = self.admit(conn.client_addr(), Transport::Tcp)?;
        let session = tcp_handler(conn, self.session.clone(), Arc::clone(&self.stats));
        Ok(self.spawn_guarded(permit, session))
    }

    #[must_use]
    pub const fn session_context(&self) -> &SessionContext {
        &self.session
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.capacity - self.available_slots()
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.available_slots() == 0
    }

    /// Receiver that fires when shutdown starts
    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.stop.subscribe()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Stop admitting, wait up to the drain timeout for every slot to be
    /// returned, then abort the sessions still holding one.
    ///
    /// Calls after the first return immediately.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(
            active = self.active_connections(),
            drain_secs = self.drain_timeout.as_secs_f64(),
            "Shutting down, draining sessions"
        );
        let _ = self.stop.send(());

        // All slots free means every session has finished
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.drain_timeout, self.slots.acquire_many(all)).await {
            Ok(_) => info!("All sessions drained"),
            Err(_) => {
                warn!(remaining = self.active_connections(), "Drain timeout reached, aborting sessions");
                let _ = self.abort.send(());
            }
        }
    }
}

/// Accept intercepted TCP connections until shutdown.
///
/// Recovery failures and transient accept errors are counted and skipped.
///
/// # Errors
///
/// Returns the listener error that made the socket unusable.
pub async fn run_accept_loop(
    listener: TproxyListener,
    manager: Arc<ConnectionManager>,
) -> Result<(), ListenerError> {
    let mut stop = manager.subscribe_shutdown();
    info!(
        listen = %listener.listen_addr(),
        max = manager.max_connections(),
        "TCP accept loop started"
    );

    while !manager.is_shutting_down() {
        let conn = tokio::select! {
            biased;
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) if e.is_recoverable() => {
                    manager.stats.record_error(e.kind());
                    debug!(kind = %e.kind(), error = %e, "Skipping connection");
                    if let Some(pause) = e.backoff() {
                        warn!(error = %e, ?pause, "Accept backing off");
                        tokio::time::sleep(pause).await;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            },
        };

        if let Err(e) = manager.handle_connection(conn) {
            debug!(error = %e, "Connection not admitted");
        }
    }

    info!("TCP accept loop stopped");
    Ok(())
}
