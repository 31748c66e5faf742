// # Server State
//
// The single mutable record describing the managed VPN server instance. It is
// owned by one `LifecycleController`; nothing else holds a copy that can be
// written back.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Port the VPN service listens on unless configured otherwise
pub const DEFAULT_LOCAL_PORT: u16 = 1194;

/// Instance name used when configure runs before install
pub const DEFAULT_INSTANCE_NAME: &str = "server";

/// Mutable state of the managed server instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    /// Installed instance; `None` means "not installed"
    pub instance_name: Option<String>,
    /// Network address of the /24 handed to clients
    pub server_network: Option<Ipv4Addr>,
    /// Port the service listens on
    pub local_port: Option<u16>,
    /// True between a successful start and a stop
    pub running: bool,
    /// Configuration changed while running; next start restarts
    pub restart_pending: bool,
    /// A router port mapping registration completed successfully
    pub port_mapped: bool,
}

impl ServerState {
    /// Derived lifecycle stage
    pub fn stage(&self) -> LifecycleStage {
        match (&self.instance_name, self.server_network, self.running) {
            (None, _, _) => LifecycleStage::Uninstalled,
            (Some(_), _, true) => LifecycleStage::Running,
            (Some(_), Some(_), false) => LifecycleStage::Configured,
            (Some(_), None, false) => LifecycleStage::Installed,
        }
    }
}

/// Rest states of the lifecycle
///
/// Starting and stopping are not represented: both complete inside a single
/// controller call. "Stopped" and "configured" are the same rest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Uninstalled,
    Installed,
    Configured,
    Running,
}

/// Point-in-time copy of controller state for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Derived stage
    pub stage: LifecycleStage,
    /// Server state at snapshot time
    pub state: ServerState,
    /// Host address the NAT rule was last installed for
    pub last_applied_local_address: Option<Ipv4Addr>,
}

/// Pick a random `10.X.Y.0` network with X and Y in `[20, 199]`
pub fn generate_network() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    let seg1: u8 = rng.gen_range(20..=199);
    let seg2: u8 = rng.gen_range(20..=199);
    Ipv4Addr::new(10, seg1, seg2, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_network_range() {
        for _ in 0..500 {
            let octets = generate_network().octets();
            assert_eq!(octets[0], 10);
            assert!((20..=199).contains(&octets[1]));
            assert!((20..=199).contains(&octets[2]));
            assert_eq!(octets[3], 0);
        }
    }

    #[test]
    fn test_stage_transitions() {
        let mut state = ServerState::default();
        assert_eq!(state.stage(), LifecycleStage::Uninstalled);

        state.instance_name = Some("server".to_string());
        assert_eq!(state.stage(), LifecycleStage::Installed);

        state.server_network = Some(Ipv4Addr::new(10, 50, 60, 0));
        assert_eq!(state.stage(), LifecycleStage::Configured);

        state.running = true;
        assert_eq!(state.stage(), LifecycleStage::Running);
    }

    #[test]
    fn test_snapshot_serializes_stage() {
        let snapshot = StatusSnapshot {
            stage: LifecycleStage::Running,
            state: ServerState::default(),
            last_applied_local_address: Some(Ipv4Addr::new(192, 168, 1, 10)),
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["stage"], "running");
        assert_eq!(json["last_applied_local_address"], "192.168.1.10");
    }
}
