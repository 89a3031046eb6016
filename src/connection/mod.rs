//! Connection handling module
//!
//! - Admission with backpressure and graceful shutdown ([`ConnectionManager`])
//! - TCP connection handling
//! - UDP flow dispatch
//! - Statistics collection

mod manager;
mod stats;
mod tcp;
mod udp;

pub use manager::{run_accept_loop, ConnectionManager};
pub use stats::{ConnectionStats, StatsSnapshot};
pub use tcp::{handle_tcp_connection, tcp_handler, TcpConnectionResult};
pub use udp::{FlowKey, UdpDispatcher};
