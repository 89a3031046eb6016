//! Session statistics tracking
//!
//! Counters for accepted flows, negotiation outcomes and relayed bytes, plus
//! one failure counter per [`ErrorKind`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::address::Transport;
use crate::error::{ErrorKind, TunnelError};
use crate::io::CopyResult;
use crate::socks5::NegotiationState;

const KIND_COUNT: usize = ErrorKind::ALL.len();

/// Atomic session statistics
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// TCP connections accepted with a recovered destination
    tcp_accepted: AtomicU64,
    /// UDP flows opened
    udp_flows: AtomicU64,
    /// Sessions currently running
    active: AtomicU64,
    /// Sessions that reached `Established`
    established: AtomicU64,
    /// Sessions that finished relaying without error
    completed: AtomicU64,
    /// Sessions that ended with an error
    failed: AtomicU64,
    /// Connections rejected due to the connection limit
    rejected: AtomicU64,
    /// Client datagrams dropped because their flow was backlogged
    dropped_datagrams: AtomicU64,
    /// Bytes client -> upstream
    bytes_up: AtomicU64,
    /// Bytes upstream -> client
    bytes_down: AtomicU64,
    failures: [AtomicU64; KIND_COUNT],
}

impl ConnectionStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new session
    pub fn record_accepted(&self, transport: Transport) {
        match transport {
            Transport::Tcp => self.tcp_accepted.fetch_add(1, Ordering::Relaxed),
            Transport::Udp => self.udp_flows.fetch_add(1, Ordering::Relaxed),
        };
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_established(&self) {
        self.established.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session that relayed to completion
    pub fn record_completed(&self, copied: CopyResult) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(copied.client_to_upstream, Ordering::Relaxed);
        self.bytes_down.fetch_add(copied.upstream_to_client, Ordering::Relaxed);
    }

    /// Record a session that ended with an error of `kind`
    pub fn record_failed(&self, kind: ErrorKind) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_error(kind);
    }

    /// Record how a session ended given its final state and relay result
    pub fn record_outcome(&self, state: NegotiationState, outcome: &Result<CopyResult, TunnelError>) {
        if state == NegotiationState::Established {
            self.record_established();
        }
        match outcome {
            Ok(copied) => self.record_completed(*copied),
            Err(e) => self.record_failed(e.kind()),
        }
    }

    /// Count an error that happened outside a session (accept, recovery)
    pub fn record_error(&self, kind: ErrorKind) {
        self.failures[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_datagram(&self) {
        self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn tcp_accepted(&self) -> u64 {
        self.tcp_accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn udp_flows(&self) -> u64 {
        self.udp_flows.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn established(&self) -> u64 {
        self.established.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped_datagrams.load(Ordering::Relaxed)
    }

    /// Errors of one kind seen so far
    #[must_use]
    pub fn failures(&self, kind: ErrorKind) -> u64 {
        self.failures[kind.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let failures = ErrorKind::ALL
            .iter()
            .filter_map(|&kind| {
                let count = self.failures(kind);
                (count > 0).then(|| (kind.as_str().to_owned(), count))
            })
            .collect();

        StatsSnapshot {
            tcp_accepted: self.tcp_accepted(),
            udp_flows: self.udp_flows(),
            active: self.active(),
            established: self.established(),
            completed: self.completed(),
            failed: self.failed(),
            rejected: self.rejected(),
            dropped_datagrams: self.dropped_datagrams(),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            failures,
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.tcp_accepted,
            &self.udp_flows,
            &self.active,
            &self.established,
            &self.completed,
            &self.failed,
            &self.rejected,
            &self.dropped_datagrams,
            &self.bytes_up,
            &self.bytes_down,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.failures {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of session statistics at a point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub tcp_accepted: u64,
    pub udp_flows: u64,
    pub active: u64,
    pub established: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub dropped_datagrams: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Non-zero error counts keyed by error kind name
    pub failures: BTreeMap<String, u64>,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl StatsSnapshot {
    /// Bytes relayed in both directions
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    /// Share of finished sessions that completed, as a percentage (0-100)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            100.0
        } else {
            (self.completed as f64 / total as f64) * 100.0
        }
    }
}
