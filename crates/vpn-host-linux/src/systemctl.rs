// # systemd Service Control
//
// ServiceControl implementation issuing `systemctl <verb> <unit>`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use vpn_core::process::{Invocation, ProcessRunner};
use vpn_core::traits::{ServiceAction, ServiceControl};
use vpn_core::{Error, Result};

/// Service control through `systemctl`
pub struct SystemctlService {
    runner: Arc<dyn ProcessRunner>,
    use_sudo: bool,
}

impl SystemctlService {
    /// Create a service controller running `systemctl` through `runner`
    pub fn new(runner: Arc<dyn ProcessRunner>, use_sudo: bool) -> Self {
        Self { runner, use_sudo }
    }
}

#[async_trait]
impl ServiceControl for SystemctlService {
    async fn control(&self, action: ServiceAction, unit: &str) -> Result<()> {
        let mut invocation = Invocation::new("systemctl").args([action.as_str(), unit]);
        if self.use_sudo {
            invocation = invocation.elevated();
        }

        info!("Running {}", invocation);
        let output = self.runner.run(&invocation).await?;

        if output.is_success() {
            Ok(())
        } else {
            Err(Error::process(
                "systemctl",
                format!(
                    "{} {} exited with {:?}: {}",
                    action,
                    unit,
                    output.code,
                    output.stderr.trim()
                ),
            ))
        }
    }
}
