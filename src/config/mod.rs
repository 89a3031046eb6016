//! Configuration module for tproxy-tunnel
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tproxy_tunnel::config::load_config;
//!
//! let config = load_config("/etc/tproxy-tunnel/config.json").unwrap();
//! println!("Listening on {}", config.listen.address);
//! ```

mod loader;
mod types;

pub use loader::{
    create_default_config, load_config, load_config_str, load_config_with_env, ENV_LISTEN_ADDR,
    ENV_LOG_LEVEL, ENV_MAX_CONNECTIONS, ENV_UPSTREAM_ADDR,
};
pub use types::{
    AuthCredential, Config, ConnectionConfig, ListenConfig, LogConfig, ProxyConfig, SessionConfig,
};
