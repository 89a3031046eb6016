//! Reading, overriding and writing configuration files

use std::io;
use std::net::SocketAddr;
use std::path::Path;

use tracing::{debug, info};

use super::types::{Config, ProxyConfig};
use crate::error::ConfigError;

/// Override for `listen.address`
pub const ENV_LISTEN_ADDR: &str = "TPROXY_TUNNEL_LISTEN_ADDR";
/// Override for `log.level`
pub const ENV_LOG_LEVEL: &str = "TPROXY_TUNNEL_LOG_LEVEL";
/// Override for `connection.max_connections`
pub const ENV_MAX_CONNECTIONS: &str = "TPROXY_TUNNEL_MAX_CONNECTIONS";
/// Override for `upstream.address` (creates an upstream if none is configured)
pub const ENV_UPSTREAM_ADDR: &str = "TPROXY_TUNNEL_UPSTREAM_ADDR";

type ApplyFn = fn(&mut Config, &str) -> Result<(), String>;

/// Variables consulted by [`load_config_with_env`], applied in order.
const OVERRIDES: &[(&str, ApplyFn)] = &[
    (ENV_LISTEN_ADDR, set_listen_addr),
    (ENV_LOG_LEVEL, set_log_level),
    (ENV_MAX_CONNECTIONS, set_max_connections),
    (ENV_UPSTREAM_ADDR, set_upstream_addr),
];

fn set_listen_addr(config: &mut Config, value: &str) -> Result<(), String> {
    config.listen.address = parse_addr(value)?;
    Ok(())
}

fn set_log_level(config: &mut Config, value: &str) -> Result<(), String> {
    config.log.level = value.to_string();
    Ok(())
}

fn set_max_connections(config: &mut Config, value: &str) -> Result<(), String> {
    config.connection.max_connections = value
        .parse()
        .map_err(|_| format!("Invalid number: {value}"))?;
    Ok(())
}

fn set_upstream_addr(config: &mut Config, value: &str) -> Result<(), String> {
    let address = parse_addr(value)?;
    config
        .upstream
        .get_or_insert_with(|| ProxyConfig::new(address))
        .address = address;
    Ok(())
}

fn parse_addr(value: &str) -> Result<SocketAddr, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid socket address: {value}"))
}

/// Parse and validate a JSON document
fn parse(json: &str, origin: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("{origin}: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a JSON file
///
/// # Errors
///
/// `FileNotFound` when the path does not exist, `ParseError` or
/// `ValidationError` for bad content.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "Reading configuration");

    let json = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ConfigError::FileNotFound {
            path: path.display().to_string(),
        },
        _ => ConfigError::IoError(e),
    })?;
    let config = parse(&json, &path.display().to_string())?;

    let upstream = config
        .upstream
        .as_ref()
        .map_or_else(|| "direct".to_string(), |u| format!("{} ({})", u.address, u.scope));
    info!(listen = %config.listen.address, %upstream, "Configuration loaded");

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    parse(json, "<inline>")
}

/// [`load_config`], then apply the `TPROXY_TUNNEL_*` environment overrides
///
/// # Errors
///
/// Fails on anything [`load_config`] rejects, on an unparsable override, or
/// when the overridden configuration no longer validates.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for (name, apply) in OVERRIDES {
        let Some(value) = lookup(name) else { continue };
        apply(config, &value).map_err(|reason| ConfigError::EnvError {
            name: (*name).to_string(),
            reason,
        })?;
        debug!(variable = *name, %value, "Applied environment override");
    }
    config.validate()
}

/// Write the default configuration as pretty JSON
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(&Config::default_config())
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(vars: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| vars.get(name).map(|v| (*v).to_string())
    }

    #[test]
    fn test_default_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        create_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert!(config.upstream.is_none());
        assert!(config.listen.tcp_enabled);
        assert_eq!(config.listen.address.port(), 7893);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load_config(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { path } if path.ends_with("absent.json")));
    }

    #[test]
    fn test_directory_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(load_config(dir.path()), Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_upstream_with_credentials() {
        let config = load_config_str(
            r#"{
                "listen": { "address": "0.0.0.0:12345" },
                "upstream": {
                    "address": "192.168.1.10:1080",
                    "username": "user",
                    "password": "secret",
                    "scope": "work"
                },
                "session": { "negotiation_timeout_ms": 2500, "spoof_source": true }
            }"#,
        )
        .unwrap();

        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.scope, "work");
        assert!(upstream.credential().is_offered());
        assert!(config.session.spoof_source);
        assert_eq!(config.session.negotiation_timeout_ms, 2500);
        assert_eq!(config.session.udp_idle_timeout_secs, 60);
    }

    #[test]
    fn test_rejects_bad_documents() {
        assert!(matches!(
            load_config_str("{ listen"),
            Err(ConfigError::ParseError(msg)) if msg.starts_with("<inline>")
        ));
        assert!(matches!(
            load_config_str(r#"{ "listen": { "address": "127.0.0.1:7893" }, "connection": { "max_connections": 0 } }"#),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default_config();
        apply_env_overrides(
            &mut config,
            lookup_from(&[
                (ENV_LISTEN_ADDR, "[::1]:9000"),
                (ENV_LOG_LEVEL, "debug"),
                (ENV_MAX_CONNECTIONS, "12"),
                (ENV_UPSTREAM_ADDR, "10.1.1.1:1081"),
            ]),
        )
        .unwrap();

        assert_eq!(config.listen.address, "[::1]:9000".parse().unwrap());
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.connection.max_connections, 12);
        assert_eq!(config.upstream.unwrap().address, "10.1.1.1:1081".parse().unwrap());
    }

    #[test]
    fn test_upstream_override_keeps_credentials() {
        let mut config = Config::default_config();
        config.upstream = Some(ProxyConfig::new("10.0.0.1:1080".parse().unwrap()).with_credentials("u", "p"));

        apply_env_overrides(&mut config, lookup_from(&[(ENV_UPSTREAM_ADDR, "10.0.0.2:1080")])).unwrap();

        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.address.to_string(), "10.0.0.2:1080");
        assert!(upstream.credential().is_offered());
    }

    #[test]
    fn test_override_errors() {
        let mut config = Config::default_config();
        let err = apply_env_overrides(&mut config, lookup_from(&[(ENV_MAX_CONNECTIONS, "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { name, .. } if name == ENV_MAX_CONNECTIONS));

        // Parses, but fails validation afterwards
        let mut config = Config::default_config();
        let err = apply_env_overrides(&mut config, lookup_from(&[(ENV_MAX_CONNECTIONS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
