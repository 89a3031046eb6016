//! tproxy-tunnel: transparent proxy data path
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tproxy-tunnel
//!
//! # Run with custom configuration
//! sudo ./tproxy-tunnel -c /path/to/config.json
//!
//! # Run with environment overrides
//! TPROXY_TUNNEL_LOG_LEVEL=debug sudo ./tproxy-tunnel
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use tproxy_tunnel::config::{load_config_with_env, Config};
use tproxy_tunnel::connection::{run_accept_loop, ConnectionManager, UdpDispatcher};
use tproxy_tunnel::error::ListenerError;
use tproxy_tunnel::session::SessionContext;
use tproxy_tunnel::tproxy::{
    has_net_admin_capability, is_root, TproxyListener, TproxyUdpListener, TransparentDialer,
};

const DEFAULT_CONFIG_PATH: &str = "/etc/tproxy-tunnel/config.json";

/// What the binary was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    GenerateConfig,
    CheckConfig,
    Help,
    Version,
}

#[derive(Debug)]
struct Args {
    config_path: PathBuf,
    mode: Mode,
}

impl Args {
    /// Parse arguments without the program name. The last mode flag wins.
    fn parse_from<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            mode: Mode::Run,
        };

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            parsed.mode = match arg.as_str() {
                "-c" | "--config" => {
                    let path = args.next().ok_or_else(|| format!("{arg} needs a path"))?;
                    parsed.config_path = PathBuf::from(path);
                    continue;
                }
                "-g" | "--generate-config" => Mode::GenerateConfig,
                "--check" => Mode::CheckConfig,
                "-h" | "--help" => Mode::Help,
                "-v" | "--version" => Mode::Version,
                other => return Err(format!("Unknown argument: {other}")),
            };
        }

        Ok(parsed)
    }
}

fn print_help() {
    println!(
        r#"tproxy-tunnel v{}

Transparent proxy that carries TPROXY-intercepted TCP and UDP flows through
a SOCKS5 upstream.

USAGE:
    tproxy-tunnel [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tproxy-tunnel/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TPROXY_TUNNEL_LISTEN_ADDR      Override listen address
    TPROXY_TUNNEL_LOG_LEVEL        Override log level (trace, debug, info, warn, error)
    TPROXY_TUNNEL_MAX_CONNECTIONS  Override maximum connections
    TPROXY_TUNNEL_UPSTREAM_ADDR    Override SOCKS5 upstream address

REQUIREMENTS:
    - Linux kernel with TPROXY support
    - CAP_NET_ADMIN capability (or root)
    - iptables TPROXY rules configured

EXAMPLE:
    iptables -t mangle -A PREROUTING -p tcp -j TPROXY \
        --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
    iptables -t mangle -A PREROUTING -p udp -j TPROXY \
        --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
    ip rule add fwmark 0x1 lookup 100
    ip route add local 0.0.0.0/0 dev lo table 100

    sudo tproxy-tunnel -c /etc/tproxy-tunnel/config.json
"#,
        tproxy_tunnel::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tokio=warn", config.log.level.to_lowercase())));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn check_prerequisites() {
    if !is_root() && !has_net_admin_capability() {
        warn!("Not running as root and CAP_NET_ADMIN not detected");
        warn!("Transparent sockets require CAP_NET_ADMIN");
        // Socket creation reports the precise failure
    }
}

fn spawn_listener_task(
    name: &'static str,
    task: impl std::future::Future<Output = Result<(), ListenerError>> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("{} stopped: {}", name, e);
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = match Args::parse_from(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            print_help();
            std::process::exit(1);
        }
    };

    match args.mode {
        Mode::Help => {
            print_help();
            return Ok(());
        }
        Mode::Version => {
            println!("tproxy-tunnel v{}", tproxy_tunnel::VERSION);
            return Ok(());
        }
        Mode::GenerateConfig => {
            tproxy_tunnel::config::create_default_config(&args.config_path)?;
            println!("Generated default configuration at {}", args.config_path.display());
            return Ok(());
        }
        Mode::CheckConfig | Mode::Run => {}
    }

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {}", args.config_path.display()))?;

    if args.mode == Mode::CheckConfig {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tproxy-tunnel v{}", tproxy_tunnel::VERSION);
    info!("Configuration loaded from {}", args.config_path.display());
    match &config.upstream {
        Some(proxy) => info!("Upstream SOCKS5 proxy {} (scope {})", proxy.address, proxy.scope),
        None => info!("No upstream configured, flows go direct"),
    }

    check_prerequisites();

    let session = SessionContext::from_config(&config, TransparentDialer::default());
    let manager = Arc::new(ConnectionManager::new(&config.connection, session));

    let mut tasks = Vec::new();

    if config.listen.tcp_enabled {
        let listener = TproxyListener::bind(&config.listen).context("Failed to create TPROXY TCP listener")?;
        tasks.push(spawn_listener_task(
            "TCP accept loop",
            run_accept_loop(listener, Arc::clone(&manager)),
        ));
    }

    if config.listen.udp_enabled {
        let listener = TproxyUdpListener::bind(&config.listen).context("Failed to create TPROXY UDP listener")?;
        let dispatcher = UdpDispatcher::new(listener, Arc::clone(&manager), config.session.udp_channel_capacity);
        tasks.push(spawn_listener_task("UDP dispatcher", dispatcher.run()));
    }

    info!(
        "tproxy-tunnel ready on {} (TCP: {}, UDP: {}) in {:.2}ms",
        config.listen.address,
        config.listen.tcp_enabled,
        config.listen.udp_enabled,
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down...");
    manager.shutdown().await;

    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }

    let stats = manager.stats_snapshot();
    info!(
        "Final stats: {} TCP connections, {} UDP flows, {} completed, {} failed, {} rejected",
        stats.tcp_accepted, stats.udp_flows, stats.completed, stats.failed, stats.rejected
    );
    info!("Transferred: {} bytes up, {} bytes down", stats.bytes_up, stats.bytes_down);
    if !stats.failures.is_empty() {
        info!(failures = ?stats.failures, "Failures by kind");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
