//! Configuration types for the VPN lifecycle controller
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::Invocation;
use crate::traits::Protocol;

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnConfig {
    /// External script tool-chain
    #[serde(default)]
    pub toolchain: ToolchainConfig,

    /// NAT rule settings
    #[serde(default)]
    pub nat: NatConfig,

    /// Router port mapping settings
    #[serde(default)]
    pub mapping: MappingConfig,

    /// Service manager settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Host network defaults
    #[serde(default)]
    pub network: NetworkConfig,

    /// Pub/sub channel names
    #[serde(default)]
    pub bus: BusConfig,

    /// Lifecycle event channel settings
    #[serde(default)]
    pub events: EventConfig,
}

impl VpnConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.toolchain.validate()?;

        if self.nat.uplink_interface.is_empty() {
            return Err(crate::Error::config("NAT uplink interface cannot be empty"));
        }

        if self.mapping.timeout_ms == 0 {
            return Err(crate::Error::config("Port mapping timeout must be > 0"));
        }

        if self.service.family.is_empty() || self.service.family.contains('@') {
            return Err(crate::Error::config(format!(
                "Invalid service family: '{}'",
                self.service.family
            )));
        }

        if self.bus.ip_change_channel.is_empty() || self.bus.subnet_changed_channel.is_empty() {
            return Err(crate::Error::config("Pub/sub channel names cannot be empty"));
        }

        if let Some(name) = &self.network.ddns_name
            && name.trim().is_empty()
        {
            return Err(crate::Error::config("DDNS name cannot be blank"));
        }

        if self.events.channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }

        Ok(())
    }
}

/// External script tool-chain configuration
///
/// Scripts are resolved relative to `scripts_dir`. Each locked operation class
/// gets its own advisory lock path so concurrent controllers cannot interleave.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Directory holding `install1.sh`, `install2.sh`, `confgen.sh`, `ovpngen.sh`
    pub scripts_dir: PathBuf,

    /// Run scripts through `sudo -E`
    pub use_sudo: bool,

    /// Directory holding generated client profiles
    pub profile_dir: PathBuf,

    /// Advisory lock guarding the second install phase
    pub install_lock: PathBuf,

    /// Advisory lock guarding server config generation
    pub confgen_lock: PathBuf,

    /// Advisory lock guarding client profile generation
    pub profile_lock: PathBuf,
}

impl ToolchainConfig {
    /// Invocation of a tool-chain script, run from `scripts_dir`
    pub fn script(&self, name: &str) -> Invocation {
        let invocation = Invocation::new(format!("./{}", name)).current_dir(&self.scripts_dir);
        if self.use_sudo {
            invocation.elevated()
        } else {
            invocation
        }
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.scripts_dir.as_os_str().is_empty() {
            return Err(crate::Error::config("Scripts directory cannot be empty"));
        }
        if self.profile_dir.as_os_str().is_empty() {
            return Err(crate::Error::config("Profile directory cannot be empty"));
        }

        let locks = [&self.install_lock, &self.confgen_lock, &self.profile_lock];
        for (i, lock) in locks.iter().enumerate() {
            if lock.as_os_str().is_empty() {
                return Err(crate::Error::config("Lock path cannot be empty"));
            }
            if locks[i + 1..].contains(lock) {
                return Err(crate::Error::config(format!(
                    "Lock path {} is shared by two operation classes",
                    lock.display()
                )));
            }
        }

        Ok(())
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("/opt/vpnd/scripts"),
            use_sudo: true,
            profile_dir: PathBuf::from("/var/lib/vpnd/ovpns"),
            install_lock: PathBuf::from("/dev/shm/vpn_install2_lock_file"),
            confgen_lock: PathBuf::from("/dev/shm/vpn_confgen_lock_file"),
            profile_lock: PathBuf::from("/dev/shm/vpn_gen_lock_file"),
        }
    }
}

/// NAT rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Uplink interface the SNAT rule is bound to
    pub uplink_interface: String,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            uplink_interface: "eth0".to_string(),
        }
    }
}

/// Router port mapping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Transport protocol of the VPN service
    pub protocol: Protocol,

    /// Hard bound on each router-control call (milliseconds)
    pub timeout_ms: u64,

    /// Description registered with the router
    pub description: String,
}

impl MappingConfig {
    /// Timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            timeout_ms: 10_000,
            description: "OpenVPN".to_string(),
        }
    }
}

/// Service manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Templated unit family; the unit is `<family>@<instance>`
    pub family: String,
}

impl ServiceConfig {
    /// Unit name for an instance
    pub fn unit_name(&self, instance: &str) -> String {
        format!("{}@{}", self.family, instance)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            family: "openvpn".to_string(),
        }
    }
}

/// Host network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// DNS server pushed to clients when the host has none configured
    pub fallback_dns: IpAddr,

    /// Resolver configuration read for the host's DNS servers
    pub resolv_conf: PathBuf,

    /// Dynamic DNS name clients should dial, if the host has one
    pub ddns_name: Option<String>,

    /// Plain-text "what is my IP" endpoint (None disables the lookup)
    pub public_ip_url: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            fallback_dns: IpAddr::from([8, 8, 8, 8]),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            ddns_name: None,
            public_ip_url: Some("https://api.ipify.org".to_string()),
        }
    }
}

/// Pub/sub channel names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Inbound host-address-change notifications
    pub ip_change_channel: String,

    /// Outbound subnet announcements
    pub subnet_changed_channel: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ip_change_channel: "System:IPChange".to_string(),
            subnet_changed_channel: "System:VPNSubnetChanged".to_string(),
        }
    }
}

/// Lifecycle event channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Capacity of the lifecycle event channel
    ///
    /// When full, new events are dropped (with a warning log).
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}
