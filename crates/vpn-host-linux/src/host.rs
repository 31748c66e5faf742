// # iproute2 Host Network
//
// HostNetwork implementation reading addressing from `ip`, DNS servers from
// resolv.conf, and (optionally) the public address from an HTTP service.
//
// ## Sources
//
// ```text
// local address  ip -4 -o addr show dev <uplink>     required
// gateway        ip -4 route show default            best effort
// dns servers    /etc/resolv.conf                    best effort
// public address PublicIpLookup (cached)             best effort
// ```

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use vpn_core::config::VpnConfig;
use vpn_core::process::{Invocation, ProcessRunner};
use vpn_core::traits::{HostNetwork, HostSnapshot};
use vpn_core::{Error, Result};

use crate::public_ip::PublicIpLookup;

/// How long a fetched public address is reused
const PUBLIC_IP_TTL: Duration = Duration::from_secs(300);

/// Host addressing read through iproute2
pub struct IpRouteHostNetwork {
    runner: Arc<dyn ProcessRunner>,
    interface: String,
    resolv_conf: PathBuf,
    ddns_name: Option<String>,
    public_ip: Option<PublicIpLookup>,
    public_cache: Mutex<Option<(Instant, IpAddr)>>,
}

impl IpRouteHostNetwork {
    /// Create a host view of `interface`
    pub fn new(runner: Arc<dyn ProcessRunner>, interface: impl Into<String>) -> Self {
        Self {
            runner,
            interface: interface.into(),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            ddns_name: None,
            public_ip: None,
            public_cache: Mutex::new(None),
        }
    }

    /// Create from the controller configuration
    pub fn from_config(runner: Arc<dyn ProcessRunner>, config: &VpnConfig) -> Self {
        let mut host = Self::new(runner, config.nat.uplink_interface.clone())
            .with_resolv_conf(config.network.resolv_conf.clone());
        host.ddns_name = config.network.ddns_name.clone();
        host.public_ip = config.network.public_ip_url.as_deref().map(PublicIpLookup::new);
        host
    }

    /// Read DNS servers from `path`
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Advertise `name` as the client endpoint
    pub fn with_ddns_name(mut self, name: impl Into<String>) -> Self {
        self.ddns_name = Some(name.into());
        self
    }

    /// Look up the public address with `lookup`
    pub fn with_public_ip(mut self, lookup: PublicIpLookup) -> Self {
        self.public_ip = Some(lookup);
        self
    }

    /// Drop the cached public address so the next snapshot fetches it again
    pub async fn invalidate_public_address(&self) {
        *self.public_cache.lock().await = None;
    }

    async fn local_address(&self) -> Result<Ipv4Addr> {
        let invocation =
            Invocation::new("ip").args(["-4", "-o", "addr", "show", "dev", self.interface.as_str()]);
        let output = self
            .runner
            .run_checked(&invocation)
            .await
            .map_err(|e| Error::host_network(format!("{}: {}", self.interface, e)))?;

        parse_interface_address(&output.stdout).ok_or_else(|| {
            Error::host_network(format!("{} has no IPv4 address", self.interface))
        })
    }

    async fn gateway(&self) -> Option<Ipv4Addr> {
        let invocation = Invocation::new("ip").args(["-4", "route", "show", "default"]);
        match self.runner.run_checked(&invocation).await {
            Ok(output) => parse_default_gateway(&output.stdout),
            Err(e) => {
                debug!("Default route unavailable: {}", e);
                None
            }
        }
    }

    async fn dns_servers(&self) -> Vec<IpAddr> {
        match tokio::fs::read_to_string(&self.resolv_conf).await {
            Ok(contents) => parse_nameservers(&contents),
            Err(e) => {
                warn!("Failed to read {}: {}", self.resolv_conf.display(), e);
                Vec::new()
            }
        }
    }

    async fn public_address(&self) -> Option<IpAddr> {
        let lookup = self.public_ip.as_ref()?;

        let mut cache = self.public_cache.lock().await;
        if let Some((fetched_at, address)) = *cache
            && fetched_at.elapsed() < PUBLIC_IP_TTL
        {
            return Some(address);
        }

        match lookup.fetch().await {
            Ok(address) => {
                *cache = Some((Instant::now(), address));
                Some(address)
            }
            Err(e) => {
                warn!("Public address lookup via {} failed: {}", lookup.url(), e);
                cache.as_ref().map(|(_, address)| *address)
            }
        }
    }
}

#[async_trait]
impl HostNetwork for IpRouteHostNetwork {
    async fn snapshot(&self) -> Result<HostSnapshot> {
        let mut snapshot = HostSnapshot::new(self.local_address().await?);
        snapshot.gateway = self.gateway().await;
        snapshot.dns_servers = self.dns_servers().await;
        snapshot.ddns_name = self.ddns_name.clone();
        snapshot.public_address = self.public_address().await;
        Ok(snapshot)
    }
}

/// First IPv4 address in `ip -4 -o addr show` output
pub fn parse_interface_address(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "inet")?;
        let cidr = tokens.next()?;
        cidr.split('/').next()?.parse().ok()
    })
}

/// Gateway of the first route in `ip -4 route show default` output
pub fn parse_default_gateway(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "via")?;
        tokens.next()?.parse().ok()
    })
}

/// `nameserver` entries of a resolv.conf, in file order
pub fn parse_nameservers(contents: &str) -> Vec<IpAddr> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("nameserver") => tokens.next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}
