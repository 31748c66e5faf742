// # Host Network Trait
//
// Read-only snapshot of the host's addressing, consumed by configure, start,
// the IP-change reactor and client profile generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Point-in-time view of host addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Address of the uplink interface
    pub local_address: Ipv4Addr,
    /// Default gateway, if known
    pub gateway: Option<Ipv4Addr>,
    /// Configured DNS servers, in preference order
    pub dns_servers: Vec<IpAddr>,
    /// Dynamic DNS name pointing at this host, if any
    pub ddns_name: Option<String>,
    /// Public (WAN) address, if known
    pub public_address: Option<IpAddr>,
}

impl HostSnapshot {
    /// Snapshot with only a local address
    pub fn new(local_address: Ipv4Addr) -> Self {
        Self {
            local_address,
            gateway: None,
            dns_servers: Vec::new(),
            ddns_name: None,
            public_address: None,
        }
    }

    /// First DNS server, or `fallback`
    pub fn primary_dns_or(&self, fallback: IpAddr) -> IpAddr {
        self.dns_servers.first().copied().unwrap_or(fallback)
    }

    /// Endpoint clients should dial: DDNS name first, then the public address
    pub fn endpoint(&self) -> Option<String> {
        self.ddns_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| self.public_address.map(|ip| ip.to_string()))
    }
}

/// Trait for host network providers
///
/// `snapshot()` must return the *current* state every time it is called;
/// caching beyond a single call belongs to callers.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Take a snapshot of host addressing
    async fn snapshot(&self) -> Result<HostSnapshot, crate::Error>;
}
