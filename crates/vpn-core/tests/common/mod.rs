//! Test doubles and common utilities for controller contract tests
//!
//! Every external system the controller touches has an in-memory stand-in
//! here that records what it was asked to do.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use vpn_core::config::{ToolchainConfig, VpnConfig};
use vpn_core::error::{Error, Result};
use vpn_core::process::{Invocation, ProcessOutput, ProcessRunner};
use vpn_core::traits::host_network::HostSnapshot;
use vpn_core::traits::{
    Firewall, HostNetwork, NatRule, PortMapper, Protocol, RuleRemoval, ServiceAction,
    ServiceControl,
};
use vpn_core::{Collaborators, ControllerEvent, LifecycleController, MemoryPubSub};

pub const HOST_A: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const HOST_B: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 77);
pub const NETWORK: Ipv4Addr = Ipv4Addr::new(10, 50, 60, 0);

/// Mapping timeout used by contract tests
pub const MAPPING_TIMEOUT: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------

/// Ordered in-memory POSTROUTING chain
#[derive(Default)]
pub struct MemoryFirewall {
    chain: Mutex<Vec<NatRule>>,
    fail_inserts: AtomicBool,
    fail_deletes: AtomicBool,
    op_delay: Mutex<Option<Duration>>,
    delete_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every operation, widening interleaving windows
    pub fn with_op_delay(delay: Duration) -> Self {
        let firewall = Self::default();
        *firewall.op_delay.lock().unwrap() = Some(delay);
        firewall
    }

    pub fn rules(&self) -> Vec<NatRule> {
        self.chain.lock().unwrap().clone()
    }

    pub fn rules_for_network(&self, network: Ipv4Addr) -> Vec<NatRule> {
        self.rules()
            .into_iter()
            .filter(|r| r.server_network == network)
            .collect()
    }

    pub fn seed(&self, rule: NatRule) {
        self.chain.lock().unwrap().push(rule);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> usize {
        self.delete_calls() + self.insert_calls()
    }

    async fn pause(&self) {
        let delay = *self.op_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn delete_rule(&self, rule: &NatRule) -> Result<RuleRemoval> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::process("iptables", "resource temporarily unavailable"));
        }

        let mut chain = self.chain.lock().unwrap();
        match chain.iter().position(|r| r == rule) {
            Some(index) => {
                chain.remove(index);
                Ok(RuleRemoval::Removed)
            }
            None => Ok(RuleRemoval::NotFound),
        }
    }

    async fn insert_rule_first(&self, rule: &NatRule) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::process("iptables", "table is locked"));
        }

        self.chain.lock().unwrap().insert(0, rule.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Port mapper
// ---------------------------------------------------------------------------

/// How the scripted router answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterBehavior {
    Succeed,
    Fail,
    /// Never answers
    Hang,
    /// Answers successfully after a delay
    AnswerAfter(Duration),
}

/// Router call seen by the mapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapperCall {
    Add { protocol: Protocol, local: u16, external: u16 },
    Remove { protocol: Protocol, local: u16, external: u16 },
}

/// Router stand-in with scripted answers
pub struct ScriptedPortMapper {
    add_behavior: Mutex<RouterBehavior>,
    remove_behavior: Mutex<RouterBehavior>,
    calls: Mutex<Vec<MapperCall>>,
    completed: AtomicUsize,
}

impl ScriptedPortMapper {
    pub fn new() -> Self {
        Self {
            add_behavior: Mutex::new(RouterBehavior::Succeed),
            remove_behavior: Mutex::new(RouterBehavior::Succeed),
            calls: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn set_add_behavior(&self, behavior: RouterBehavior) {
        *self.add_behavior.lock().unwrap() = behavior;
    }

    pub fn set_remove_behavior(&self, behavior: RouterBehavior) {
        *self.remove_behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> Vec<MapperCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn add_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MapperCall::Add { .. }))
            .count()
    }

    /// Calls whose router answer actually arrived
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    async fn answer(&self, behavior: RouterBehavior) -> Result<()> {
        match behavior {
            RouterBehavior::Succeed => {}
            RouterBehavior::Fail => {
                return Err(Error::mapping("No IGD UPnP Device found on the network"));
            }
            RouterBehavior::Hang => std::future::pending::<()>().await,
            RouterBehavior::AnswerAfter(delay) => tokio::time::sleep(delay).await,
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PortMapper for ScriptedPortMapper {
    async fn add_mapping(
        &self,
        protocol: Protocol,
        local_port: u16,
        external_port: u16,
        _description: &str,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(MapperCall::Add {
            protocol,
            local: local_port,
            external: external_port,
        });
        let behavior = *self.add_behavior.lock().unwrap();
        self.answer(behavior).await
    }

    async fn remove_mapping(
        &self,
        protocol: Protocol,
        local_port: u16,
        external_port: u16,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(MapperCall::Remove {
            protocol,
            local: local_port,
            external: external_port,
        });
        let behavior = *self.remove_behavior.lock().unwrap();
        self.answer(behavior).await
    }

    fn mapper_name(&self) -> &'static str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Process runner
// ---------------------------------------------------------------------------

/// Records script invocations; scripts can be told to exit non-zero
#[derive(Default)]
pub struct RecordingProcessRunner {
    invocations: Mutex<Vec<Invocation>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_script(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Invocations of the script `name`, e.g. `confgen.sh`
    pub fn script_calls(&self, name: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| script_name(i) == name)
            .collect()
    }
}

/// File name of the program an invocation runs
pub fn script_name(invocation: &Invocation) -> String {
    Path::new(&invocation.program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl ProcessRunner for RecordingProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.invocations.lock().unwrap().push(invocation.clone());

        if self.failing.lock().unwrap().contains(&script_name(invocation)) {
            return Ok(ProcessOutput::failure(1, "script failed"));
        }
        Ok(ProcessOutput::success(""))
    }
}

// ---------------------------------------------------------------------------
// Service manager
// ---------------------------------------------------------------------------

/// Records service commands; individual verbs can be made to fail
#[derive(Default)]
pub struct RecordingServiceControl {
    commands: Mutex<Vec<(ServiceAction, String)>>,
    failing: Mutex<HashSet<ServiceAction>>,
}

impl RecordingServiceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_action(&self, action: ServiceAction) {
        self.failing.lock().unwrap().insert(action);
    }

    pub fn commands(&self) -> Vec<(ServiceAction, String)> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands rendered as `"<verb> <unit>"`
    pub fn command_lines(&self) -> Vec<String> {
        self.commands()
            .iter()
            .map(|(action, unit)| format!("{} {}", action, unit))
            .collect()
    }
}

#[async_trait]
impl ServiceControl for RecordingServiceControl {
    async fn control(&self, action: ServiceAction, unit: &str) -> Result<()> {
        self.commands
            .lock()
            .unwrap()
            .push((action, unit.to_string()));

        if self.failing.lock().unwrap().contains(&action) {
            return Err(Error::process("systemctl", format!("Job for {} failed", unit)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host network
// ---------------------------------------------------------------------------

/// Host whose address tests can change at will
pub struct StaticHostNetwork {
    snapshot: Mutex<HostSnapshot>,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl StaticHostNetwork {
    pub fn new(local_address: Ipv4Addr) -> Self {
        let mut snapshot = HostSnapshot::new(local_address);
        snapshot.dns_servers = vec![IpAddr::from([192, 168, 1, 1])];
        snapshot.public_address = Some(IpAddr::from([203, 0, 113, 7]));
        Self {
            snapshot: Mutex::new(snapshot),
            unavailable: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    pub fn set_local_address(&self, address: Ipv4Addr) {
        self.snapshot.lock().unwrap().local_address = address;
    }

    pub fn set_dns_servers(&self, servers: Vec<IpAddr>) {
        self.snapshot.lock().unwrap().dns_servers = servers;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sleep before answering every snapshot
    pub fn set_snapshot_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl HostNetwork for StaticHostNetwork {
    async fn snapshot(&self) -> Result<HostSnapshot> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::host_network("uplink interface has no IPv4 address"));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Configuration with all host paths inside `dir` and no sudo
pub fn test_config(dir: &Path) -> VpnConfig {
    let mut config = VpnConfig::new();
    config.toolchain = ToolchainConfig {
        scripts_dir: dir.join("scripts"),
        use_sudo: false,
        profile_dir: dir.join("ovpns"),
        install_lock: dir.join("install.lock"),
        confgen_lock: dir.join("confgen.lock"),
        profile_lock: dir.join("gen.lock"),
    };
    config.mapping.timeout_ms = MAPPING_TIMEOUT.as_millis() as u64;
    config
}

/// Controller wired to test doubles
pub struct Harness {
    pub controller: Arc<LifecycleController>,
    pub events: mpsc::Receiver<ControllerEvent>,
    pub firewall: Arc<MemoryFirewall>,
    pub mapper: Arc<ScriptedPortMapper>,
    pub service: Arc<RecordingServiceControl>,
    pub host: Arc<StaticHostNetwork>,
    pub pubsub: MemoryPubSub,
    pub runner: Arc<RecordingProcessRunner>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_firewall(MemoryFirewall::new())
    }

    pub fn with_firewall(firewall: MemoryFirewall) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let firewall = Arc::new(firewall);
        let mapper = Arc::new(ScriptedPortMapper::new());
        let service = Arc::new(RecordingServiceControl::new());
        let host = Arc::new(StaticHostNetwork::new(HOST_A));
        let pubsub = MemoryPubSub::new();
        let runner = Arc::new(RecordingProcessRunner::new());

        let collaborators = Collaborators {
            firewall: firewall.clone(),
            port_mapper: mapper.clone(),
            service: service.clone(),
            host: host.clone(),
            pubsub: Arc::new(pubsub.clone()),
            runner: runner.clone(),
        };

        let (controller, events) =
            LifecycleController::new(collaborators, test_config(dir.path()))
                .expect("controller construction succeeds");

        Self {
            controller: Arc::new(controller),
            events,
            firewall,
            mapper,
            service,
            host,
            pubsub,
            runner,
            dir,
        }
    }

    /// Installed and configured for `NETWORK:1194`
    pub async fn configured() -> Self {
        let harness = Self::new();
        harness.controller.install("server").await.unwrap();
        harness
            .controller
            .configure(
                vpn_core::ConfigureOptions::default()
                    .with_server_network(NETWORK)
                    .with_local_port(1194),
                false,
            )
            .await
            .unwrap();
        harness
    }

    /// Drain every event emitted so far
    pub fn drain_events(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
