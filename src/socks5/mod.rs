//! SOCKS5 client side: negotiation state machine and UDP relay framing
//!
//! - [`handshake`]: greeting, method selection, optional username/password
//!   authentication and the CONNECT / UDP ASSOCIATE request
//! - [`udp`]: the UDP datagram envelope used once an association exists

pub mod common;
pub mod handshake;
pub mod udp;

pub use handshake::{Command, NegotiationState, Socks5Negotiator};
pub use udp::RelayPacket;
