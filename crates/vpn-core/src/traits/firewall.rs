// # Firewall Trait
//
// Defines the interface for manipulating the outbound NAT table.
//
// ## Implementations
//
// - iptables: `vpn-host-linux` crate
//
// The reconciler only ever needs three primitives: delete a rule if present,
// and insert a rule at the top of the chain so it is matched first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Source NAT rule translating the VPN subnet to the host address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatRule {
    /// Network address of the VPN subnet (always a /24)
    pub server_network: Ipv4Addr,
    /// Uplink interface the rule is bound to
    pub out_interface: String,
    /// Host address the subnet is translated to
    pub to_source: Ipv4Addr,
}

impl NatRule {
    /// Create a new rule
    pub fn new(
        server_network: Ipv4Addr,
        out_interface: impl Into<String>,
        to_source: Ipv4Addr,
    ) -> Self {
        Self {
            server_network,
            out_interface: out_interface.into(),
            to_source,
        }
    }

    /// Source match in CIDR form, e.g. `10.50.60.0/24`
    pub fn source_cidr(&self) -> String {
        format!("{}/24", self.server_network)
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -o {} -> {}",
            self.source_cidr(),
            self.out_interface,
            self.to_source
        )
    }
}

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleRemoval {
    /// A matching rule existed and was deleted
    Removed,
    /// No matching rule existed
    NotFound,
}

/// Trait for NAT table implementations
///
/// Implementations must be thread-safe and usable across async tasks. They
/// must not serialize calls themselves; ordering is owned by
/// [`crate::nat::NatReconciler`].
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Delete one rule matching `rule` exactly
    ///
    /// # Returns
    ///
    /// - `Ok(RuleRemoval::Removed)`: A matching rule was deleted
    /// - `Ok(RuleRemoval::NotFound)`: Nothing matched
    /// - `Err(Error)`: The table could not be inspected or modified
    async fn delete_rule(&self, rule: &NatRule) -> Result<RuleRemoval, crate::Error>;

    /// Insert `rule` at the top of the POSTROUTING chain
    async fn insert_rule_first(&self, rule: &NatRule) -> Result<(), crate::Error>;
}
