// # vpn-host-linux
//
// Linux adapters for the capability traits of `vpn-core`.
//
// ## Adapters
//
// - **IptablesFirewall**: NAT rules via `iptables -t nat`
// - **SystemctlService**: service control via `systemctl`
// - **UpnpcPortMapper**: router port mapping via miniupnpc's `upnpc`
// - **IpRouteHostNetwork**: host addressing via iproute2 and resolv.conf
// - **AddressMonitor**: `ip monitor` events published to the IP-change channel
// - **PublicIpLookup**: public address from an HTTP service
//
// Every adapter except the monitor runs its commands through a
// `ProcessRunner`, so each can be exercised without touching the host.

pub mod host;
pub mod iptables;
pub mod monitor;
pub mod public_ip;
pub mod systemctl;
pub mod upnp;

#[cfg(test)]
mod testing;

pub use host::IpRouteHostNetwork;
pub use iptables::IptablesFirewall;
pub use monitor::AddressMonitor;
pub use public_ip::PublicIpLookup;
pub use systemctl::SystemctlService;
pub use upnp::UpnpcPortMapper;
