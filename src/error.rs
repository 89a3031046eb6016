//! Error types for tproxy-tunnel
//!
//! Errors are grouped by the layer that produces them: destination recovery,
//! socket construction and dialing, SOCKS5 negotiation, UDP relay framing,
//! listeners and configuration. [`TunnelError`] wraps all of them and
//! [`ErrorKind`] gives a flat classification for logs and statistics.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Transport;
use crate::socks5::common::reply_message;
use crate::socks5::NegotiationState;

/// Flat classification of every failure a session can end with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RecoveryUnavailable,
    RecoveryMissing,
    RecoveryMalformed,
    AddressFamilyMismatch,
    PrivilegeDenied,
    ProtocolVersionMismatch,
    MethodRejected,
    AuthRejected,
    ConnectRejected,
    NameTooLong,
    AddressInvalid,
    NegotiationTimeout,
    UnsupportedTransport,
    /// Transport failure outside the protocol taxonomy (refused connect, reset, EOF)
    Io,
    Config,
    Listener,
}

impl ErrorKind {
    pub const ALL: [Self; 16] = [
        Self::RecoveryUnavailable,
        Self::RecoveryMissing,
        Self::RecoveryMalformed,
        Self::AddressFamilyMismatch,
        Self::PrivilegeDenied,
        Self::ProtocolVersionMismatch,
        Self::MethodRejected,
        Self::AuthRejected,
        Self::ConnectRejected,
        Self::NameTooLong,
        Self::AddressInvalid,
        Self::NegotiationTimeout,
        Self::UnsupportedTransport,
        Self::Io,
        Self::Config,
        Self::Listener,
    ];

    /// Position in [`ErrorKind::ALL`]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Stable snake_case name, used as a log field
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RecoveryUnavailable => "recovery_unavailable",
            Self::RecoveryMissing => "recovery_missing",
            Self::RecoveryMalformed => "recovery_malformed",
            Self::AddressFamilyMismatch => "address_family_mismatch",
            Self::PrivilegeDenied => "privilege_denied",
            Self::ProtocolVersionMismatch => "protocol_version_mismatch",
            Self::MethodRejected => "method_rejected",
            Self::AuthRejected => "auth_rejected",
            Self::ConnectRejected => "connect_rejected",
            Self::NameTooLong => "name_too_long",
            Self::AddressInvalid => "address_invalid",
            Self::NegotiationTimeout => "negotiation_timeout",
            Self::UnsupportedTransport => "unsupported_transport",
            Self::Io => "io",
            Self::Config => "config",
            Self::Listener => "listener",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for tproxy-tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Original destination could not be recovered
    #[error("Destination recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// Socket construction or dial failure
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    /// SOCKS5 negotiation failure
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// UDP relay framing failure
    #[error("UDP framing error: {0}")]
    Framing(#[from] FramingError),

    /// Listener failure
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors during relaying
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Recovery(e) => e.kind(),
            Self::Socket(e) => e.kind(),
            Self::Negotiation(e) => e.kind(),
            Self::Framing(e) => e.kind(),
            Self::Listener(e) => e.kind(),
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Check if the process can keep serving other flows after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Recovery(_) | Self::Negotiation(_) | Self::Framing(_) | Self::Io(_) => true,
            Self::Socket(e) => e.is_recoverable(),
            Self::Listener(e) => e.is_recoverable(),
            Self::Config(_) => false,
        }
    }
}

/// Original-destination recovery errors
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The destination option is unsupported or the socket was not redirected
    #[error("original destination unavailable: {0}")]
    Unavailable(String),

    /// No original-destination record in the control messages
    #[error("no original destination record in control messages")]
    Missing,

    /// A record was present but could not be parsed
    #[error("malformed original destination record: {0}")]
    Malformed(String),
}

impl RecoveryError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::RecoveryUnavailable,
            Self::Missing => ErrorKind::RecoveryMissing,
            Self::Malformed(_) => ErrorKind::RecoveryMalformed,
        }
    }

    /// Create a malformed-record error for a short buffer
    pub fn short(what: &str, needed: usize, actual: usize) -> Self {
        Self::Malformed(format!("{what}: need {needed} bytes, got {actual}"))
    }
}

/// Socket construction and dial errors
#[derive(Debug, Error)]
pub enum SocketError {
    /// Local and remote endpoints differ in address family or transport
    #[error("address family mismatch: local {local}, remote {remote}")]
    AddressFamilyMismatch { local: String, remote: String },

    /// `IP_TRANSPARENT` was refused (CAP_NET_ADMIN required)
    #[error("permission denied: transparent sockets require CAP_NET_ADMIN")]
    PrivilegeDenied,

    /// `socket(2)` failed
    #[error("failed to create socket: {0}")]
    Creation(#[source] io::Error),

    /// A socket option could not be set or read
    #[error("failed to set socket option {option}: {source}")]
    Option {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    /// The descriptor has a socket type other than stream or datagram
    #[error("unsupported socket type {0}")]
    UnsupportedType(i32),

    /// `bind(2)` failed
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `connect(2)` failed
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AddressFamilyMismatch { .. } => ErrorKind::AddressFamilyMismatch,
            Self::PrivilegeDenied => ErrorKind::PrivilegeDenied,
            Self::UnsupportedType(_) => ErrorKind::UnsupportedTransport,
            Self::Creation(_) | Self::Option { .. } | Self::Bind { .. } | Self::Connect { .. } => {
                ErrorKind::Io
            }
        }
    }

    /// Missing privileges are fatal; everything else is scoped to one flow
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::PrivilegeDenied)
    }

    /// Create a socket option error, mapping EPERM to [`SocketError::PrivilegeDenied`]
    #[must_use]
    pub fn option(option: &'static str, source: io::Error) -> Self {
        if source.raw_os_error() == Some(libc::EPERM) {
            return Self::PrivilegeDenied;
        }
        Self::Option { option, source }
    }
}

/// SOCKS5 negotiation errors
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The server answered with a version other than 5
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u8, actual: u8 },

    /// The server selected a method we did not offer
    #[error("method rejected: server selected {0:#04x}")]
    MethodRejected(u8),

    /// Username/password authentication failed
    #[error("authentication rejected: status {0:#04x}")]
    AuthRejected(u8),

    /// A credential does not fit its 1-byte length prefix
    #[error("{field} too long ({len} bytes, max 255)")]
    CredentialTooLong { field: &'static str, len: usize },

    /// CONNECT (or UDP ASSOCIATE) was refused
    #[error("connect rejected: version {version}, reply {code:#04x} ({})", reply_message(*.code))]
    ConnectRejected { version: u8, code: u8 },

    /// Domain name longer than 255 bytes
    #[error("domain name too long ({0} bytes, max 255)")]
    NameTooLong(usize),

    /// Address bytes are neither IPv4 nor IPv6, or otherwise unusable
    #[error("invalid address: {0}")]
    AddressInvalid(String),

    /// The per-session deadline elapsed
    #[error("negotiation timed out in state {state}")]
    NegotiationTimeout { state: NegotiationState },

    /// The stream failed mid-negotiation
    #[error("{stage} failed: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

impl NegotiationError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolVersionMismatch { .. } => ErrorKind::ProtocolVersionMismatch,
            Self::MethodRejected(_) => ErrorKind::MethodRejected,
            Self::AuthRejected(_) | Self::CredentialTooLong { .. } => ErrorKind::AuthRejected,
            Self::ConnectRejected { .. } => ErrorKind::ConnectRejected,
            Self::NameTooLong(_) => ErrorKind::NameTooLong,
            Self::AddressInvalid(_) => ErrorKind::AddressInvalid,
            Self::NegotiationTimeout { .. } => ErrorKind::NegotiationTimeout,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Wrap a stream error with the step that produced it
    #[must_use]
    pub const fn io(stage: &'static str, source: io::Error) -> Self {
        Self::Io { stage, source }
    }
}

/// SOCKS5 UDP envelope errors
#[derive(Debug, Error)]
pub enum FramingError {
    /// Only UDP payloads can be framed
    #[error("unsupported transport for UDP relay framing: {0}")]
    UnsupportedTransport(Transport),

    /// Envelope shorter than its header
    #[error("truncated UDP envelope: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Address type other than IPv4 on decode
    #[error("unsupported address type in UDP envelope: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Fragmented envelopes are not reassembled
    #[error("fragmented UDP envelope (frag={0})")]
    Fragmented(u8),

    /// Domain name longer than 255 bytes
    #[error("domain name too long ({0} bytes, max 255)")]
    NameTooLong(usize),

    /// Destination cannot be encoded
    #[error("invalid destination: {0}")]
    InvalidAddress(String),
}

impl FramingError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedTransport(_) => ErrorKind::UnsupportedTransport,
            Self::NameTooLong(_) => ErrorKind::NameTooLong,
            Self::Truncated { .. }
            | Self::UnsupportedAddressType(_)
            | Self::Fragmented(_)
            | Self::InvalidAddress(_) => ErrorKind::AddressInvalid,
        }
    }
}

/// TPROXY listener errors
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Listening socket could not be set up
    #[error("listener socket: {0}")]
    Socket(#[from] SocketError),

    /// `accept(2)` failed
    #[error("accept error: {0}")]
    Accept(#[source] io::Error),

    /// `recvmsg(2)` failed
    #[error("receive error: {0}")]
    Recv(#[source] io::Error),

    /// An accepted flow carried no usable destination
    #[error("{0}")]
    Recovery(#[from] RecoveryError),
}

impl ListenerError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Socket(e) => e.kind(),
            Self::Recovery(e) => e.kind(),
            Self::Accept(_) | Self::Recv(_) => ErrorKind::Listener,
        }
    }

    /// Per-flow failures are recoverable; a broken listening socket is not
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Socket(_) => false,
            Self::Recovery(_) => true,
            Self::Accept(e) | Self::Recv(e) => !matches!(
                e.kind(),
                io::ErrorKind::InvalidInput | io::ErrorKind::PermissionDenied
            ),
        }
    }

    /// Pause before the next accept/receive when the error signals resource
    /// exhaustion (descriptor or buffer limits), which retrying at once
    /// cannot clear.
    #[must_use]
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            Self::Accept(e) | Self::Recv(e) => match e.raw_os_error() {
                Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
                    Some(RESOURCE_BACKOFF)
                }
                _ => None,
            },
            Self::Socket(_) | Self::Recovery(_) => None,
        }
    }
}

/// Delay applied by listeners after a resource-exhaustion error
pub const RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// Admission errors from the connection manager
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection limit reached ({current}/{max})")]
    LimitReached { current: usize, max: usize },

    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Result type alias using [`TunnelError`]
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_index_matches_all() {
        for (i, kind) in ErrorKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i, "{kind}");
        }
    }

    #[test]
    fn test_kind_mapping() {
        let err: TunnelError = RecoveryError::Missing.into();
        assert_eq!(err.kind(), ErrorKind::RecoveryMissing);

        let err: TunnelError = NegotiationError::MethodRejected(0xff).into();
        assert_eq!(err.kind(), ErrorKind::MethodRejected);

        let err: TunnelError = FramingError::UnsupportedTransport(Transport::Tcp).into();
        assert_eq!(err.kind(), ErrorKind::UnsupportedTransport);

        let err: TunnelError = NegotiationError::NegotiationTimeout {
            state: NegotiationState::GreetingSent,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NegotiationTimeout);
    }

    #[test]
    fn test_eperm_maps_to_privilege_denied() {
        let err = SocketError::option("IP_TRANSPARENT", io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(err, SocketError::PrivilegeDenied));
        assert!(!err.is_recoverable());

        let err = SocketError::option("IP_TRANSPARENT", io::Error::from_raw_os_error(libc::EINVAL));
        assert!(matches!(err, SocketError::Option { option: "IP_TRANSPARENT", .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_descriptor_exhaustion_backs_off() {
        for errno in [libc::EMFILE, libc::ENFILE] {
            let err = ListenerError::Accept(io::Error::from_raw_os_error(errno));
            assert!(err.is_recoverable());
            assert_eq!(err.backoff(), Some(RESOURCE_BACKOFF));
        }

        let err = ListenerError::Recv(io::Error::from_raw_os_error(libc::ENOBUFS));
        assert_eq!(err.backoff(), Some(RESOURCE_BACKOFF));

        let err = ListenerError::Accept(io::Error::from_raw_os_error(libc::ECONNABORTED));
        assert!(err.is_recoverable());
        assert_eq!(err.backoff(), None);
        assert_eq!(ListenerError::Recovery(RecoveryError::Missing).backoff(), None);
    }

    #[test]
    fn test_recoverability() {
        let err: TunnelError = ConfigError::ValidationError("bad".into()).into();
        assert!(!err.is_recoverable());

        let err: TunnelError = SocketError::PrivilegeDenied.into();
        assert!(!err.is_recoverable());

        let err: TunnelError = NegotiationError::AuthRejected(2).into();
        assert!(err.is_recoverable());

        let err = ListenerError::Accept(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = NegotiationError::ConnectRejected {
            version: 5,
            code: 0x05,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x05"));
        assert!(msg.contains("connection refused"));

        let err = SocketError::PrivilegeDenied;
        assert!(err.to_string().contains("CAP_NET_ADMIN"));

        assert_eq!(ErrorKind::NameTooLong.to_string(), "name_too_long");
    }
}
