//! VPN server lifecycle controller
//!
//! The LifecycleController is responsible for:
//! - Installing the server instance via the external tool-chain
//! - Generating server configuration
//! - Starting, restarting and stopping the VPN service
//! - Keeping the NAT rule and the router port mapping in step with the service
//!
//! ## Architecture
//!
//! ```text
//!                        ┌─────────────────────┐
//!   IpChangeReactor ────►│ LifecycleController │◄──── operator / daemon
//!                        └─────────────────────┘
//!                                   │
//!       ┌──────────────┬────────────┼─────────────┬──────────────┐
//!       ▼              ▼            ▼             ▼              ▼
//! ┌────────────┐ ┌───────────┐ ┌──────────┐ ┌───────────┐ ┌────────────┐
//! │NatReconcile│ │MappingGuard│ │ Service  │ │ Scripts   │ │  PubSub    │
//! │ (iptables) │ │  (router) │ │(systemd) │ │(+ locks)  │ │ (announce) │
//! └────────────┘ └───────────┘ └──────────┘ └───────────┘ └────────────┘
//! ```
//!
//! ## Start Sequence
//!
//! 1. Request a public reachability check (fire-and-forget)
//! 2. Return cached status if already running and no restart is pending
//! 3. Remove any stale router mapping (errors ignored)
//! 4. `start` or `restart` the service
//! 5. Install the NAT rule; on failure stop again and fail
//! 6. Register the router mapping and announce the subnet; a mapping
//!    failure degrades the result but does not fail it

use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::VpnConfig;
use crate::credentials::{ClientProfile, ClientProfileStore, ProfileRequest};
use crate::error::{Error, Result};
use crate::mapping::{MappingRequest, PortMappingGuard};
use crate::nat::{NatReconciler, ReconcileOutcome};
use crate::process::ProcessRunner;
use crate::state::{
    DEFAULT_INSTANCE_NAME, DEFAULT_LOCAL_PORT, ServerState, StatusSnapshot, generate_network,
};
use crate::traits::{
    Firewall, HostNetwork, PortMapper, PubSub, ServiceAction, ServiceControl,
};

/// Events emitted by the LifecycleController
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The service is about to start; the public address should be re-checked
    PublicIpCheckRequested,

    /// Install sequence completed
    Installed { instance: String },

    /// Server configuration generated
    Configured {
        server_network: Ipv4Addr,
        local_port: u16,
        restart_pending: bool,
    },

    /// Service running with the router mapping in place
    Started { status: ServerStatus },

    /// Service running without external reachability
    StartDegraded { status: ServerStatus, reason: String },

    /// NAT rule re-applied for a new host address
    NatReconciled { host_address: Ipv4Addr },

    /// Stop sequence completed
    Stopped,
}

/// Externally visible status of a start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    /// VPN subnet network address
    pub server_network: Option<Ipv4Addr>,
    /// Port the service listens on
    pub local_port: u16,
    /// Port reachable from outside, when mapped
    pub external_port: Option<u16>,
    /// Whether the router mapping is registered
    pub port_mapped: bool,
}

/// Result of [`LifecycleController::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Service started (or restarted) and the router mapping registered
    Started(ServerStatus),
    /// Service was already running; nothing was done
    AlreadyRunning(ServerStatus),
    /// Service running, but the router mapping failed
    Degraded { status: ServerStatus, reason: String },
}

impl StartOutcome {
    /// Status carried by the outcome
    pub fn status(&self) -> &ServerStatus {
        match self {
            StartOutcome::Started(status) | StartOutcome::AlreadyRunning(status) => status,
            StartOutcome::Degraded { status, .. } => status,
        }
    }

    /// Whether the outcome is a degraded success
    pub fn is_degraded(&self) -> bool {
        matches!(self, StartOutcome::Degraded { .. })
    }
}

/// Caller overrides for [`LifecycleController::configure`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigureOptions {
    /// VPN subnet network address (must end in `.0`)
    pub server_network: Option<Ipv4Addr>,
    /// Service port
    pub local_port: Option<u16>,
}

impl ConfigureOptions {
    /// Override the server network
    pub fn with_server_network(mut self, network: Ipv4Addr) -> Self {
        self.server_network = Some(network);
        self
    }

    /// Override the service port
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }
}

/// External systems the controller drives
pub struct Collaborators {
    /// NAT table
    pub firewall: Arc<dyn Firewall>,
    /// Router port mapping
    pub port_mapper: Arc<dyn PortMapper>,
    /// Service manager
    pub service: Arc<dyn ServiceControl>,
    /// Host addressing
    pub host: Arc<dyn HostNetwork>,
    /// Event transport
    pub pubsub: Arc<dyn PubSub>,
    /// Script runner
    pub runner: Arc<dyn ProcessRunner>,
}

/// Owner of the VPN server lifecycle
///
/// ## Lifecycle
///
/// 1. Create with [`LifecycleController::new()`]
/// 2. [`install()`](Self::install) and [`configure()`](Self::configure)
/// 3. [`start()`](Self::start) / [`stop()`](Self::stop) as needed
/// 4. Share via `Arc` with an [`IpChangeReactor`](crate::reactor::IpChangeReactor)
///
/// ## Threading
///
/// All methods take `&self`. The state lock is never held across an external
/// call, so the IP-change reactor can reconcile while a lifecycle call is in
/// flight; NAT rule ordering is protected by the reconciler's own lock.
pub struct LifecycleController {
    state: RwLock<ServerState>,
    reconciler: NatReconciler,
    mapping: PortMappingGuard,
    profiles: ClientProfileStore,
    service: Arc<dyn ServiceControl>,
    host: Arc<dyn HostNetwork>,
    pubsub: Arc<dyn PubSub>,
    runner: Arc<dyn ProcessRunner>,
    config: VpnConfig,
    event_tx: mpsc::Sender<ControllerEvent>,
}

impl LifecycleController {
    /// Create a new controller
    ///
    /// # Returns
    ///
    /// A tuple of (controller, event_receiver) where event_receiver yields
    /// lifecycle events
    pub fn new(
        collaborators: Collaborators,
        config: VpnConfig,
    ) -> Result<(Self, mpsc::Receiver<ControllerEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.events.channel_capacity);

        let Collaborators {
            firewall,
            port_mapper,
            service,
            host,
            pubsub,
            runner,
        } = collaborators;

        let controller = Self {
            state: RwLock::new(ServerState::default()),
            reconciler: NatReconciler::new(firewall, config.nat.uplink_interface.clone()),
            mapping: PortMappingGuard::new(port_mapper, config.mapping.timeout()),
            profiles: ClientProfileStore::new(runner.clone(), config.toolchain.clone()),
            service,
            host,
            pubsub,
            runner,
            config,
            event_tx: tx,
        };

        Ok((controller, rx))
    }

    /// Controller configuration
    pub fn config(&self) -> &VpnConfig {
        &self.config
    }

    /// Copy of the current state
    pub async fn status(&self) -> StatusSnapshot {
        let state = self.state.read().await.clone();
        StatusSnapshot {
            stage: state.stage(),
            state,
            last_applied_local_address: self.reconciler.last_applied_address().await,
        }
    }

    /// Install the server instance
    ///
    /// Runs `install1.sh <instance>`, then `install2.sh <instance>` under the
    /// install lock. The instance name is recorded only when both succeed.
    pub async fn install(&self, instance_name: &str) -> Result<()> {
        validate_instance_name(instance_name)?;

        let toolchain = &self.config.toolchain;
        info!("Installing VPN server instance {}", instance_name);

        let phase1 = toolchain.script("install1.sh").arg(instance_name);
        self.runner.run_checked(&phase1).await.map_err(|e| {
            error!("Unable to run install1.sh for {}: {}", instance_name, e);
            Error::install(instance_name, e.to_string())
        })?;

        let phase2 = toolchain
            .script("install2.sh")
            .arg(instance_name)
            .locked_by(&toolchain.install_lock);
        self.runner.run_checked(&phase2).await.map_err(|e| {
            error!("Unable to run install2.sh for {}: {}", instance_name, e);
            Error::install(instance_name, e.to_string())
        })?;

        self.state.write().await.instance_name = Some(instance_name.to_string());
        info!("Installed VPN server instance {}", instance_name);

        self.emit_event(ControllerEvent::Installed {
            instance: instance_name.to_string(),
        });
        Ok(())
    }

    /// Record an instance installed by an earlier run without re-running the
    /// install scripts
    pub async fn adopt(&self, instance_name: &str) -> Result<()> {
        validate_instance_name(instance_name)?;

        let mut state = self.state.write().await;
        if let Some(current) = &state.instance_name
            && current != instance_name
        {
            warn!("Replacing instance {} with {}", current, instance_name);
        }
        state.instance_name = Some(instance_name.to_string());
        debug!("Adopted VPN server instance {}", instance_name);
        Ok(())
    }

    /// Merge options into the state and generate the server configuration
    ///
    /// Fields merged before a generation failure stay merged.
    pub async fn configure(&self, options: ConfigureOptions, need_restart: bool) -> Result<()> {
        if let Some(network) = options.server_network
            && network.octets()[3] != 0
        {
            return Err(Error::config(format!(
                "Server network {} is not a /24 network address",
                network
            )));
        }
        if options.local_port == Some(0) {
            return Err(Error::config("Local port cannot be 0"));
        }

        let (instance, network, port) = {
            let mut state = self.state.write().await;
            if let Some(network) = options.server_network {
                state.server_network = Some(network);
            }
            if let Some(port) = options.local_port {
                state.local_port = Some(port);
            }

            let network = *state.server_network.get_or_insert_with(generate_network);
            let port = *state.local_port.get_or_insert(DEFAULT_LOCAL_PORT);
            let instance = state
                .instance_name
                .get_or_insert_with(|| DEFAULT_INSTANCE_NAME.to_string())
                .clone();
            (instance, network, port)
        };

        let host = self.host.snapshot().await.map_err(|e| {
            Error::config_generation(format!("Host address unavailable: {}", e))
        })?;
        let dns = host.primary_dns_or(self.config.network.fallback_dns);

        let toolchain = &self.config.toolchain;
        let invocation = toolchain
            .script("confgen.sh")
            .args([
                instance.clone(),
                host.local_address.to_string(),
                dns.to_string(),
                network.to_string(),
                port.to_string(),
            ])
            .locked_by(&toolchain.confgen_lock);

        info!("Generating server config: {}", invocation);
        self.runner.run_checked(&invocation).await.map_err(|e| {
            error!("Unable to generate server config for {}: {}", instance, e);
            Error::config_generation(e.to_string())
        })?;

        let restart_pending = {
            let mut state = self.state.write().await;
            if need_restart {
                state.restart_pending = true;
            }
            state.restart_pending
        };

        info!("Server config generated for {}", instance);
        self.emit_event(ControllerEvent::Configured {
            server_network: network,
            local_port: port,
            restart_pending,
        });
        Ok(())
    }

    /// Start (or restart) the VPN service
    ///
    /// # Returns
    ///
    /// - `Ok(StartOutcome::Started)`: Running and reachable
    /// - `Ok(StartOutcome::AlreadyRunning)`: Nothing to do
    /// - `Ok(StartOutcome::Degraded)`: Running, router mapping failed
    /// - `Err(Error::NotInstalled)`: No instance to start
    /// - `Err(Error::ServiceStart)`: Service command failed on a stopped server
    /// - `Err(Error::NatRuleApply)`: NAT rule failed; the service was stopped
    pub async fn start(&self) -> Result<StartOutcome> {
        self.emit_event(ControllerEvent::PublicIpCheckRequested);

        let (instance, local_port, was_running, restart) = {
            let mut state = self.state.write().await;

            if state.running && !state.restart_pending {
                info!("VPN server already started");
                return Ok(StartOutcome::AlreadyRunning(cached_status(&state)));
            }

            let Some(instance) = state.instance_name.clone() else {
                warn!("Start requested before the server instance was installed");
                return Err(Error::NotInstalled);
            };

            let local_port = state.local_port.unwrap_or(DEFAULT_LOCAL_PORT);
            let restart = std::mem::take(&mut state.restart_pending);
            (instance, local_port, state.running, restart)
        };

        let request = self.mapping_request(local_port);
        match self.mapping.remove_mapping(request).await {
            Ok(_) => self.state.write().await.port_mapped = false,
            Err(e) => debug!("Stale port mapping cleanup failed: {}", e),
        }

        let action = if restart {
            ServiceAction::Restart
        } else {
            ServiceAction::Start
        };
        let unit = self.config.service.unit_name(&instance);

        match self.service.control(action, &unit).await {
            Ok(()) => info!("{} {} succeeded", action, unit),
            Err(e) if !was_running => {
                error!("{} {} failed: {}", action, unit, e);
                return Err(Error::service_start(format!("{} {}: {}", action, unit, e)));
            }
            Err(e) => {
                // The previous instance is assumed to still be serving.
                warn!("{} {} failed, keeping running state: {}", action, unit, e);
            }
        }

        let server_network = {
            let mut state = self.state.write().await;
            state.running = true;
            state.server_network
        };

        if let Err(e) = self.apply_nat(server_network).await {
            error!("Failed to set NAT rule, stopping service: {}", e);
            if let Err(stop_err) = self.stop().await {
                warn!("Unwinding stop failed: {}", stop_err);
            }
            return Err(e);
        }

        let mapping = self
            .mapping
            .add_mapping(request, &self.config.mapping.description)
            .await;

        if let Some(network) = server_network {
            self.announce_subnet(network).await;
        }

        match mapping {
            Ok(_) => {
                self.state.write().await.port_mapped = true;
                let status = ServerStatus {
                    server_network,
                    local_port,
                    external_port: Some(request.external_port),
                    port_mapped: true,
                };
                info!("VPN server {} started", instance);
                self.emit_event(ControllerEvent::Started { status });
                Ok(StartOutcome::Started(status))
            }
            Err(e) => {
                warn!("VPN server {} started without port mapping: {}", instance, e);
                self.state.write().await.port_mapped = false;
                let status = ServerStatus {
                    server_network,
                    local_port,
                    external_port: None,
                    port_mapped: false,
                };
                let reason = e.to_string();
                self.emit_event(ControllerEvent::StartDegraded {
                    status,
                    reason: reason.clone(),
                });
                Ok(StartOutcome::Degraded { status, reason })
            }
        }
    }

    /// Stop the VPN service
    ///
    /// `running` is cleared before anything else is attempted and stays
    /// cleared whatever fails afterwards.
    pub async fn stop(&self) -> Result<()> {
        let (instance, server_network, local_port) = {
            let mut state = self.state.write().await;
            state.running = false;
            (
                state.instance_name.clone(),
                state.server_network,
                state.local_port.unwrap_or(DEFAULT_LOCAL_PORT),
            )
        };

        let Some(instance) = instance else {
            warn!("Stop requested before the server instance was installed");
            return Err(Error::NotInstalled);
        };

        match self.mapping.remove_mapping(self.mapping_request(local_port)).await {
            Ok(_) => self.state.write().await.port_mapped = false,
            Err(e) => warn!("Failed to remove port mapping on stop: {}", e),
        }

        let unit = self.config.service.unit_name(&instance);
        info!("Stopping {}", unit);
        self.service
            .control(ServiceAction::Stop, &unit)
            .await
            .map_err(|e| {
                error!("stop {} failed: {}", unit, e);
                Error::service_stop(format!("stop {}: {}", unit, e))
            })?;

        // The recorded rule wins over the current network and host address,
        // either of which may have changed since it was installed.
        let removed = self.reconciler.unapply_recorded().await?;
        if removed.is_none() && server_network.is_some() {
            let host = self.host.snapshot().await.map_err(|e| {
                Error::nat_unapply(format!("Host address unavailable: {}", e))
            })?;
            self.reconciler
                .unapply(server_network, host.local_address)
                .await?;
        }

        self.emit_event(ControllerEvent::Stopped);
        Ok(())
    }

    /// Re-apply the NAT rule for the current host address
    ///
    /// Skipped while the server is not running, and also when no rule is
    /// installed by the time the reconciler lock is taken: a `stop()` that
    /// lands while the host address is being read wins.
    pub async fn reconcile_current_address(&self) -> Result<ReconcileOutcome> {
        let (running, server_network) = {
            let state = self.state.read().await;
            (state.running, state.server_network)
        };

        if !running || server_network.is_none() {
            debug!("VPN server not running, skipping NAT reconciliation");
            return Ok(ReconcileOutcome::Skipped);
        }

        let host_address = self.current_host_address().await?;
        let outcome = self
            .reconciler
            .reapply(server_network, host_address)
            .await?;

        if matches!(outcome, ReconcileOutcome::Applied(_)) {
            self.emit_event(ControllerEvent::NatReconciled { host_address });
        }
        Ok(outcome)
    }

    /// Cached or freshly generated profile for a client
    pub async fn client_profile(&self, request: &ProfileRequest) -> Result<ClientProfile> {
        let local_port = self
            .state
            .read()
            .await
            .local_port
            .unwrap_or(DEFAULT_LOCAL_PORT);

        let host = self.host.snapshot().await.map_err(|e| {
            Error::credential(format!("Host address unavailable: {}", e))
        })?;

        self.profiles
            .load_or_generate(request, local_port, &host)
            .await
    }

    async fn apply_nat(&self, server_network: Option<Ipv4Addr>) -> Result<ReconcileOutcome> {
        if server_network.is_none() {
            debug!("No server network configured, skipping NAT apply");
            return Ok(ReconcileOutcome::Skipped);
        }

        let host_address = self.current_host_address().await?;
        let outcome = self.reconciler.apply(server_network, host_address).await?;

        self.emit_event(ControllerEvent::NatReconciled { host_address });
        Ok(outcome)
    }

    async fn current_host_address(&self) -> Result<Ipv4Addr> {
        self.host
            .snapshot()
            .await
            .map(|host| host.local_address)
            .map_err(|e| Error::nat_apply(format!("Host address unavailable: {}", e)))
    }

    async fn announce_subnet(&self, network: Ipv4Addr) {
        let channel = &self.config.bus.subnet_changed_channel;
        let message = format!("{}/24", network);

        if let Err(e) = self.pubsub.publish(channel, &message).await {
            warn!("Failed to announce subnet {} on {}: {}", message, channel, e);
        }
    }

    fn mapping_request(&self, local_port: u16) -> MappingRequest {
        MappingRequest::symmetric(self.config.mapping.protocol, local_port)
    }

    /// Emit a controller event
    fn emit_event(&self, event: ControllerEvent) {
        // Send event, logging warning if channel is full (backpressure)
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping controller event");
        }
    }
}

fn cached_status(state: &ServerState) -> ServerStatus {
    let local_port = state.local_port.unwrap_or(DEFAULT_LOCAL_PORT);
    ServerStatus {
        server_network: state.server_network,
        local_port,
        external_port: state.port_mapped.then_some(local_port),
        port_mapped: state.port_mapped,
    }
}

fn validate_instance_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(Error::install(name, "Invalid instance name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_status_reflects_mapping() {
        let mut state = ServerState {
            instance_name: Some("server".to_string()),
            server_network: Some(Ipv4Addr::new(10, 50, 60, 0)),
            local_port: Some(1194),
            running: true,
            ..ServerState::default()
        };

        let unmapped = cached_status(&state);
        assert_eq!(unmapped.external_port, None);
        assert!(!unmapped.port_mapped);

        state.port_mapped = true;
        let mapped = cached_status(&state);
        assert_eq!(mapped.external_port, Some(1194));
        assert!(mapped.port_mapped);
    }

    #[test]
    fn test_instance_name_validation() {
        assert!(validate_instance_name("server").is_ok());
        assert!(validate_instance_name("site_2-b").is_ok());
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("a@b").is_err());
        assert!(validate_instance_name("../x").is_err());
    }

    #[test]
    fn test_start_outcome_accessors() {
        let status = ServerStatus {
            server_network: None,
            local_port: 1194,
            external_port: None,
            port_mapped: false,
        };
        let degraded = StartOutcome::Degraded {
            status,
            reason: "timeout".to_string(),
        };

        assert!(degraded.is_degraded());
        assert_eq!(degraded.status(), &status);
        assert!(!StartOutcome::AlreadyRunning(status).is_degraded());
    }
}
