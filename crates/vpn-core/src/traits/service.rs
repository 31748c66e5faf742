// # Service Control Trait
//
// Start/stop/restart of the VPN daemon through the host service manager.

use async_trait::async_trait;
use std::fmt;

/// Service manager verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    /// Verb as understood by the service manager
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for service manager implementations
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Apply `action` to `unit` and wait for the command to finish
    async fn control(&self, action: ServiceAction, unit: &str) -> Result<(), crate::Error>;
}
