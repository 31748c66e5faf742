// # Port Mapper Trait
//
// Defines the interface to the router-control protocol (UPnP IGD or similar).
//
// ## Implementations
//
// - `upnpc` command line client: `vpn-host-linux` crate
//
// Router calls can hang indefinitely. Callers never await a `PortMapper`
// directly; they go through [`crate::mapping::PortMappingGuard`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    /// Lowercase protocol name
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(crate::Error::config(format!("Unknown protocol: {}", other))),
        }
    }
}

/// Trait for router port-mapping implementations
///
/// # Trust Level: Untrusted
///
/// The router is an external device. Implementations should issue a single
/// request per call and return its result; they must not retry, and they may
/// block for an unbounded time (the guard enforces the bound).
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Register `external_port` on the router, forwarding to `local_port`
    async fn add_mapping(
        &self,
        protocol: Protocol,
        local_port: u16,
        external_port: u16,
        description: &str,
    ) -> Result<(), crate::Error>;

    /// Remove the mapping for `external_port`
    async fn remove_mapping(
        &self,
        protocol: Protocol,
        local_port: u16,
        external_port: u16,
    ) -> Result<(), crate::Error>;

    /// Mapper name (for logging/debugging)
    fn mapper_name(&self) -> &'static str;
}
