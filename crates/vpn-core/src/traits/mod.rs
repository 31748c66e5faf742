//! Capability traits for the VPN lifecycle controller
//!
//! This module defines the abstract interfaces to every external system.
//!
//! - [`Firewall`]: Install and delete NAT rules
//! - [`PortMapper`]: Router-control port forwarding
//! - [`ServiceControl`]: Start/stop/restart the VPN daemon
//! - [`HostNetwork`]: Read-only snapshot of host addressing
//! - [`PubSub`]: Generic publish/subscribe transport

pub mod firewall;
pub mod host_network;
pub mod port_mapper;
pub mod pubsub;
pub mod service;

pub use firewall::{Firewall, NatRule, RuleRemoval};
pub use host_network::{HostNetwork, HostSnapshot};
pub use port_mapper::{PortMapper, Protocol};
pub use pubsub::{MessageStream, PubSub};
pub use service::{ServiceAction, ServiceControl};
