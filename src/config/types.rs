//! Configuration types for tproxy-tunnel
//!
//! Configuration is loaded from JSON files and validated at startup.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum length of a SOCKS5 username or password
const MAX_CREDENTIAL_LEN: usize = 255;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listen configuration for TPROXY
    pub listen: ListenConfig,

    /// Upstream SOCKS5 proxy; `None` dials every flow directly
    #[serde(default)]
    pub upstream: Option<ProxyConfig>,

    /// Per-session behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Connection limits
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;
        if let Some(upstream) = &self.upstream {
            upstream.validate()?;
        }
        self.session.validate()?;
        self.connection.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration (bypass mode)
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            listen: ListenConfig::default(),
            upstream: None,
            session: SessionConfig::default(),
            connection: ConnectionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Listen configuration for TPROXY inbound
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Listen address (e.g., "127.0.0.1:7893" or "[::1]:7893")
    pub address: SocketAddr,

    /// Enable TCP TPROXY
    #[serde(default = "default_true")]
    pub tcp_enabled: bool,

    /// Enable UDP TPROXY
    #[serde(default = "default_true")]
    pub udp_enabled: bool,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub tcp_backlog: u32,

    /// Enable SO_REUSEPORT on the listening sockets
    #[serde(default)]
    pub reuse_port: bool,
}

impl ListenConfig {
    /// Validate listen configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tcp_enabled && !self.udp_enabled {
            return Err(ConfigError::ValidationError(
                "At least one of tcp_enabled or udp_enabled must be true".into(),
            ));
        }

        if self.tcp_backlog == 0 {
            return Err(ConfigError::ValidationError(
                "tcp_backlog must be greater than 0".into(),
            ));
        }

        if self.address.port() == 0 {
            return Err(ConfigError::ValidationError(
                "listen port must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 7893)),
            tcp_enabled: true,
            udp_enabled: true,
            tcp_backlog: default_backlog(),
            reuse_port: false,
        }
    }
}

/// Upstream SOCKS5 proxy descriptor
#[derive(Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Upstream proxy address
    pub address: SocketAddr,

    /// Username; empty means no authentication offered
    #[serde(default)]
    pub username: String,

    /// Password; empty means no authentication offered
    #[serde(default)]
    pub password: String,

    /// Label identifying this upstream in logs and session keys
    #[serde(default = "default_scope")]
    pub scope: String,
}

impl ProxyConfig {
    /// Create an upstream without credentials
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            username: String::new(),
            password: String::new(),
            scope: default_scope(),
        }
    }

    /// Attach username/password credentials
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Credential pair used by the SOCKS5 negotiator
    #[must_use]
    pub fn credential(&self) -> AuthCredential {
        AuthCredential::new(self.username.clone(), self.password.clone())
    }

    /// Validate upstream configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.port() == 0 {
            return Err(ConfigError::ValidationError(
                "upstream port must be non-zero".into(),
            ));
        }

        if self.username.len() > MAX_CREDENTIAL_LEN || self.password.len() > MAX_CREDENTIAL_LEN {
            return Err(ConfigError::ValidationError(format!(
                "upstream credentials are limited to {MAX_CREDENTIAL_LEN} bytes each"
            )));
        }

        if self.scope.is_empty() {
            return Err(ConfigError::ValidationError(
                "upstream scope cannot be empty".into(),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("scope", &self.scope)
            .finish()
    }
}

/// Username/password pair; empty strings mean "not offered"
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthCredential {
    pub username: String,
    pub password: String,
}

impl AuthCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// No authentication
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Username/password is offered only when both fields are non-empty
    #[must_use]
    pub fn is_offered(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .finish()
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// Per-session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Deadline covering the upstream dial and the whole SOCKS5 negotiation
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// UDP flows are torn down after this many seconds without traffic
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    /// Bind upstream sockets to the client's IP instead of the unspecified address
    #[serde(default)]
    pub spoof_source: bool,

    /// Queued datagrams per UDP flow before new ones are dropped
    #[serde(default = "default_udp_channel_capacity")]
    pub udp_channel_capacity: usize,
}

/// Upper bound for `negotiation_timeout_ms` (10 minutes)
pub const MAX_NEGOTIATION_TIMEOUT_MS: u64 = 600_000;
/// Upper bound for `udp_idle_timeout_secs` and `drain_timeout_secs` (1 day)
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_NEGOTIATION_TIMEOUT_MS).contains(&self.negotiation_timeout_ms) {
            return Err(ConfigError::ValidationError(format!(
                "negotiation_timeout_ms must be between 1 and {MAX_NEGOTIATION_TIMEOUT_MS}"
            )));
        }

        if !(1..=MAX_TIMEOUT_SECS).contains(&self.udp_idle_timeout_secs) {
            return Err(ConfigError::ValidationError(format!(
                "udp_idle_timeout_secs must be between 1 and {MAX_TIMEOUT_SECS}"
            )));
        }

        if self.udp_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "udp_channel_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            spoof_source: false,
            udp_channel_capacity: default_udp_channel_capacity(),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Maximum concurrent TCP sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Buffer size for bidirectional copy and UDP receive
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Graceful shutdown drain timeout in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.buffer_size < 1024 {
            return Err(ConfigError::ValidationError(
                "buffer_size must be at least 1024 bytes".into(),
            ));
        }

        if self.drain_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ConfigError::ValidationError(format!(
                "drain_timeout_secs must be at most {MAX_TIMEOUT_SECS}"
            )));
        }

        Ok(())
    }

    /// Get drain timeout as Duration
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "log format must be \"json\" or \"text\", got \"{}\"",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

const fn default_backlog() -> u32 {
    1024
}

fn default_scope() -> String {
    "default".into()
}

const fn default_negotiation_timeout_ms() -> u64 {
    10_000
}

const fn default_udp_idle_timeout_secs() -> u64 {
    60
}

const fn default_udp_channel_capacity() -> usize {
    256
}

const fn default_max_connections() -> usize {
    65536
}

const fn default_buffer_size() -> usize {
    64 * 1024
}

const fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}
