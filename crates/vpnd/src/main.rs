// # vpnd - VPN Server Daemon
//
// The vpnd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Wiring the Linux host adapters into the lifecycle controller
// 4. Bringing the server up, keeping NAT in step with address changes, and
//    tearing it down on shutdown
//
// All lifecycle logic lives in vpn-core; this is a thin integration layer.
//
// ## Configuration
//
// ### Base
// - `VPND_CONFIG`: JSON file with a full `VpnConfig` (environment overrides it)
// - `VPND_LOG_LEVEL`: trace, debug, info, warn, error
//
// ### Server
// - `VPND_INSTANCE`: Instance name (default `server`)
// - `VPND_INSTALL`: Run the install sequence at startup (`true`/`false`)
// - `VPND_SERVER_NETWORK`: /24 network address, e.g. `10.50.60.0`
// - `VPND_LOCAL_PORT`: Service port (default 1194)
// - `VPND_SERVICE_FAMILY`: systemd unit family (default `openvpn`)
//
// ### Host
// - `VPND_SCRIPTS_DIR`: Directory holding the install/config scripts
// - `VPND_PROFILE_DIR`: Directory holding client profiles
// - `VPND_USE_SUDO`: Prefix host commands with `sudo -E`
// - `VPND_UPLINK_INTERFACE`: Interface for NAT and address monitoring
// - `VPND_DDNS_NAME`: Endpoint name written into client profiles
// - `VPND_PUBLIC_IP_URL`: Public address lookup URL (empty disables)
//
// ### Timeouts
// - `VPND_MAPPING_TIMEOUT_MS`: Bound on each router call
// - `VPND_STOP_TIMEOUT_SECS`: Bound on the shutdown stop sequence
//
// ## Example
//
// ```bash
// export VPND_INSTALL=true
// export VPND_SERVER_NETWORK=10.50.60.0
// export VPND_UPLINK_INTERFACE=eth0
// export VPND_DDNS_NAME=gw.example.net
//
// vpnd
// ```

use anyhow::{Context, Result};
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use vpn_core::traits::{PubSub, Protocol};
use vpn_core::{
    Collaborators, ConfigureOptions, ControllerEvent, IpChangeReactor, LifecycleController,
    MemoryPubSub, StartOutcome, SystemProcessRunner, VpnConfig,
};
use vpn_host_linux::{
    AddressMonitor, IpRouteHostNetwork, IptablesFirewall, SystemctlService, UpnpcPortMapper,
};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum VpndExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<VpndExitCode> for ExitCode {
    fn from(code: VpndExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug)]
struct Config {
    vpn: VpnConfig,
    instance: String,
    install: bool,
    server_network: Option<Ipv4Addr>,
    local_port: Option<u16>,
    stop_timeout: Duration,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vpn = match lookup("VPND_CONFIG") {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read VPND_CONFIG file {}", path))?;
                serde_json::from_str::<VpnConfig>(&text)
                    .with_context(|| format!("Invalid JSON in VPND_CONFIG file {}", path))?
            }
            None => VpnConfig::new(),
        };

        if let Some(dir) = lookup("VPND_SCRIPTS_DIR") {
            vpn.toolchain.scripts_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("VPND_PROFILE_DIR") {
            vpn.toolchain.profile_dir = PathBuf::from(dir);
        }
        if let Some(use_sudo) = parse_var(&lookup, "VPND_USE_SUDO")? {
            vpn.toolchain.use_sudo = use_sudo;
        }
        if let Some(interface) = lookup("VPND_UPLINK_INTERFACE") {
            vpn.nat.uplink_interface = interface;
        }
        if let Some(timeout_ms) = parse_var(&lookup, "VPND_MAPPING_TIMEOUT_MS")? {
            vpn.mapping.timeout_ms = timeout_ms;
        }
        if let Some(protocol) = parse_var::<Protocol, _>(&lookup, "VPND_MAPPING_PROTOCOL")? {
            vpn.mapping.protocol = protocol;
        }
        if let Some(family) = lookup("VPND_SERVICE_FAMILY") {
            vpn.service.family = family;
        }
        if let Some(name) = lookup("VPND_DDNS_NAME") {
            vpn.network.ddns_name = Some(name);
        }
        if let Some(url) = lookup("VPND_PUBLIC_IP_URL") {
            vpn.network.public_ip_url = (!url.is_empty()).then_some(url);
        }

        Ok(Self {
            vpn,
            instance: lookup("VPND_INSTANCE").unwrap_or_else(|| "server".to_string()),
            install: parse_var(&lookup, "VPND_INSTALL")?.unwrap_or(false),
            server_network: parse_var(&lookup, "VPND_SERVER_NETWORK")?,
            local_port: parse_var(&lookup, "VPND_LOCAL_PORT")?,
            stop_timeout: Duration::from_secs(
                parse_var(&lookup, "VPND_STOP_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            log_level: lookup("VPND_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.vpn
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        if self.instance.is_empty()
            || !self
                .instance
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "VPND_INSTANCE '{}' is not valid. \
                Use letters, digits, '-' and '_' only",
                self.instance
            );
        }

        if let Some(network) = self.server_network
            && network.octets()[3] != 0
        {
            anyhow::bail!(
                "VPND_SERVER_NETWORK must be a /24 network address ending in .0. Got: {}",
                network
            );
        }

        if self.local_port == Some(0) {
            anyhow::bail!("VPND_LOCAL_PORT cannot be 0");
        }

        if self.stop_timeout.is_zero() {
            anyhow::bail!("VPND_STOP_TIMEOUT_SECS must be > 0");
        }

        if let Some(url) = &self.vpn.network.public_ip_url
            && !url.starts_with("https://")
            && !url.starts_with("http://")
        {
            anyhow::bail!(
                "VPND_PUBLIC_IP_URL must use HTTP or HTTPS scheme. Got: {}",
                url
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "VPND_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }
}

/// Parse an optional variable, failing on malformed values
fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        None => Ok(None),
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return VpndExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return VpndExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return VpndExitCode::ConfigError.into();
    }

    info!("Starting vpnd daemon");
    info!(
        "Configuration loaded: instance {}, uplink {}",
        config.instance, config.vpn.nat.uplink_interface
    );

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return VpndExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            VpndExitCode::RuntimeError
        } else {
            VpndExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon
async fn run_daemon(config: Config) -> Result<()> {
    let vpn = config.vpn.clone();
    let use_sudo = vpn.toolchain.use_sudo;

    let runner = Arc::new(SystemProcessRunner::new());
    let bus = MemoryPubSub::new();
    let pubsub: Arc<dyn PubSub> = Arc::new(bus.clone());
    let host = Arc::new(IpRouteHostNetwork::from_config(runner.clone(), &vpn));

    let collaborators = Collaborators {
        firewall: Arc::new(IptablesFirewall::new(runner.clone(), use_sudo)),
        port_mapper: Arc::new(UpnpcPortMapper::new(runner.clone(), host.clone())),
        service: Arc::new(SystemctlService::new(runner.clone(), use_sudo)),
        host: host.clone(),
        pubsub: pubsub.clone(),
        runner,
    };

    let (controller, mut events) = LifecycleController::new(collaborators, vpn.clone())?;
    let controller = Arc::new(controller);

    // Controller events: refresh the public address on request, log the rest
    let event_host = host.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ControllerEvent::PublicIpCheckRequested => {
                    event_host.invalidate_public_address().await
                }
                other => info!("Controller event: {:?}", other),
            }
        }
    });

    let mut announcements = pubsub.subscribe(&vpn.bus.subnet_changed_channel);
    let announcement_task = tokio::spawn(async move {
        while let Some(subnet) = announcements.next().await {
            info!("VPN subnet announced: {}", subnet);
        }
    });

    // Reactor and monitor run before start so no address change is missed
    let reactor = IpChangeReactor::new(controller.clone(), pubsub.clone());
    let (reactor_tx, reactor_rx) = oneshot::channel();
    let reactor_task = tokio::spawn(async move { reactor.run_with_shutdown(Some(reactor_rx)).await });

    let monitor = AddressMonitor::new(
        pubsub.clone(),
        vpn.bus.ip_change_channel.clone(),
        vpn.nat.uplink_interface.clone(),
    );
    let (monitor_tx, monitor_rx) = oneshot::channel();
    let monitor_task = tokio::spawn(async move { monitor.run_with_shutdown(monitor_rx).await });

    let bring_up = bring_up(&controller, &config).await;

    let outcome = match bring_up {
        Ok(()) => {
            info!("Daemon initialized successfully");
            wait_for_shutdown().await.map(|signal| {
                info!("Received shutdown signal: {}", signal);
            })
        }
        Err(e) => Err(e),
    };

    info!("Shutting down daemon");
    let _ = reactor_tx.send(());
    let _ = monitor_tx.send(());

    for (name, task) in [("reactor", reactor_task), ("monitor", monitor_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} exited with error: {}", name, e),
            Err(e) => warn!("{} task failed: {}", name, e),
        }
    }

    if controller.status().await.state.running {
        match tokio::time::timeout(config.stop_timeout, controller.stop()).await {
            Ok(Ok(())) => info!("VPN server stopped"),
            Ok(Err(e)) => error!("Failed to stop VPN server: {}", e),
            Err(_) => error!("Stop timed out after {:?}", config.stop_timeout),
        }
    }

    event_task.abort();
    announcement_task.abort();

    outcome
}

/// Install (optionally), configure, and start the server
async fn bring_up(controller: &LifecycleController, config: &Config) -> Result<()> {
    if config.install {
        controller
            .install(&config.instance)
            .await
            .context("Install failed")?;
    } else {
        controller
            .adopt(&config.instance)
            .await
            .context("Invalid instance")?;
    }

    let mut options = ConfigureOptions::default();
    if let Some(network) = config.server_network {
        options = options.with_server_network(network);
    }
    if let Some(port) = config.local_port {
        options = options.with_local_port(port);
    }

    controller
        .configure(options, false)
        .await
        .context("Configure failed")?;

    match controller.start().await.context("Start failed")? {
        StartOutcome::Started(status) => info!(
            "VPN server running on {:?}/24, port {} mapped",
            status.server_network, status.local_port
        ),
        StartOutcome::AlreadyRunning(_) => info!("VPN server already running"),
        StartOutcome::Degraded { status, reason } => warn!(
            "VPN server running on port {} without router mapping: {}",
            status.local_port, reason
        ),
    }

    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let signal = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(signal)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.instance, "server");
        assert!(!config.install);
        assert_eq!(config.server_network, None);
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("VPND_INSTALL", "true"),
            ("VPND_SERVER_NETWORK", "10.50.60.0"),
            ("VPND_LOCAL_PORT", "1195"),
            ("VPND_USE_SUDO", "false"),
            ("VPND_UPLINK_INTERFACE", "br0"),
            ("VPND_MAPPING_PROTOCOL", "tcp"),
            ("VPND_PUBLIC_IP_URL", ""),
        ])
        .unwrap();

        assert!(config.install);
        assert_eq!(config.server_network, Some(Ipv4Addr::new(10, 50, 60, 0)));
        assert_eq!(config.local_port, Some(1195));
        assert!(!config.vpn.toolchain.use_sudo);
        assert_eq!(config.vpn.nat.uplink_interface, "br0");
        assert_eq!(config.vpn.mapping.protocol, Protocol::Tcp);
        assert_eq!(config.vpn.network.public_ip_url, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        let err = config_from(&[("VPND_LOCAL_PORT", "eleven")]).unwrap_err();
        assert!(err.to_string().contains("VPND_LOCAL_PORT"));
    }

    #[test]
    fn test_validation_rejects_host_address_network() {
        let config = config_from(&[("VPND_SERVER_NETWORK", "10.50.60.9")]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_log_level() {
        let config = config_from(&[("VPND_LOG_LEVEL", "verbose")]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnd.json");
        std::fs::write(
            &path,
            r#"{ "service": { "family": "openvpn-server" }, "mapping": { "timeout_ms": 5000 } }"#,
        )
        .unwrap();

        let config = config_from(&[
            ("VPND_CONFIG", path.to_str().unwrap()),
            ("VPND_MAPPING_TIMEOUT_MS", "2000"),
        ])
        .unwrap();

        assert_eq!(config.vpn.service.family, "openvpn-server");
        assert_eq!(config.vpn.mapping.timeout_ms, 2000, "environment wins");
    }
}
