// # UPnP Port Mapper
//
// PortMapper implementation driving the miniupnpc `upnpc` client.
//
// `upnpc` exits 0 for most router-side failures, so success is decided from
// its output:
//
// ```text
// add ok:     external 203.0.113.7:1194 UDP is redirected to internal 192.168.1.10:1194
// add failed: AddPortMapping(1194, 1194, 192.168.1.10) failed with code 718 (ConflictInMappingEntry)
// remove:     UPNP_DeletePortMapping() returned : 0
// no router:  No IGD UPnP Device found on the network !
// ```
//
// The mapper never applies its own timeout. Callers bound it with
// `PortMappingGuard`; dropping the call kills the child process.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use vpn_core::process::{Invocation, ProcessOutput, ProcessRunner};
use vpn_core::traits::{HostNetwork, PortMapper, Protocol};
use vpn_core::{Error, Result};

const UPNPC: &str = "upnpc";

/// Port mapper backed by `upnpc`
pub struct UpnpcPortMapper {
    runner: Arc<dyn ProcessRunner>,
    host: Arc<dyn HostNetwork>,
}

impl UpnpcPortMapper {
    /// Create a mapper forwarding to the host's current local address
    pub fn new(runner: Arc<dyn ProcessRunner>, host: Arc<dyn HostNetwork>) -> Self {
        Self { runner, host }
    }
}

#[async_trait]
impl PortMapper for UpnpcPortMapper {
    async fn add_mapping(
        &self,
        protocol: Protocol,
        local_port: u16,
        external_port: u16,
        description: &str,
    ) -> Result<()> {
        let local_address = self.host.snapshot().await?.local_address;

        let invocation = Invocation::new(UPNPC).args([
            "-e".to_string(),
            description.to_string(),
            "-a".to_string(),
            local_address.to_string(),
            local_port.to_string(),
            external_port.to_string(),
            protocol_arg(protocol).to_string(),
        ]);

        debug!("Running {}", invocation);
        let output = self.runner.run(&invocation).await?;
        check_add_output(&output).map_err(Error::mapping)
    }

    async fn remove_mapping(
        &self,
        protocol: Protocol,
        _local_port: u16,
        external_port: u16,
    ) -> Result<()> {
        let invocation = Invocation::new(UPNPC).args([
            "-d".to_string(),
            external_port.to_string(),
            protocol_arg(protocol).to_string(),
        ]);

        debug!("Running {}", invocation);
        let output = self.runner.run(&invocation).await?;
        check_remove_output(&output).map_err(Error::mapping)
    }

    fn mapper_name(&self) -> &'static str {
        "upnpc"
    }
}

fn protocol_arg(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Udp => "UDP",
        Protocol::Tcp => "TCP",
    }
}

/// Decide whether an `upnpc -a` run registered the mapping
pub fn check_add_output(output: &ProcessOutput) -> std::result::Result<(), String> {
    if let Some(line) = failure_line(&output.stdout) {
        return Err(line);
    }
    if output.stdout.contains("is redirected to internal") {
        return Ok(());
    }
    Err(unexpected(output))
}

/// Decide whether an `upnpc -d` run removed the mapping
pub fn check_remove_output(output: &ProcessOutput) -> std::result::Result<(), String> {
    if let Some(line) = failure_line(&output.stdout) {
        return Err(line);
    }

    let returned = output
        .stdout
        .lines()
        .find(|l| l.contains("UPNP_DeletePortMapping() returned"))
        .and_then(|l| l.rsplit(':').next())
        .map(str::trim);

    match returned {
        Some("0") => Ok(()),
        Some(code) => Err(format!("UPNP_DeletePortMapping returned {}", code)),
        None => Err(unexpected(output)),
    }
}

fn failure_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|l| l.contains("failed with code") || l.contains("No IGD UPnP Device"))
        .map(|l| l.trim().to_string())
}

fn unexpected(output: &ProcessOutput) -> String {
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    format!("upnpc exited with {:?}: {}", output.code, detail)
}
