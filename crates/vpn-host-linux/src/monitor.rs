// # Address Monitor
//
// Watches `ip -4 monitor address` and publishes one notification on the
// IP-change channel for every IPv4 address event on the uplink interface.
//
// ## Architecture
//
// ```text
// ip -4 monitor address ──lines──► AddressMonitor ──publish──► System:IPChange
// ```
//
// If the `ip` process exits, it is respawned after a fixed delay. The
// notification payload is the raw event line; subscribers only rely on the
// arrival of a message.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use vpn_core::traits::PubSub;
use vpn_core::{Error, Result};

/// Delay before respawning a dead `ip monitor`
const RESPAWN_DELAY_SECS: u64 = 5;

/// Publishes host address changes of one interface
pub struct AddressMonitor {
    pubsub: Arc<dyn PubSub>,
    channel: String,
    interface: String,
}

impl AddressMonitor {
    /// Create a monitor for `interface` publishing on `channel`
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        channel: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            pubsub,
            channel: channel.into(),
            interface: interface.into(),
        }
    }

    /// Run until `shutdown_rx` fires
    pub async fn run_with_shutdown(&self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        info!(
            "Starting address monitoring (interface={}, channel={})",
            self.interface, self.channel
        );

        loop {
            tokio::select! {
                result = self.watch_once() => {
                    match result {
                        Ok(()) => warn!("ip monitor exited, respawning"),
                        Err(e) => warn!("ip monitor failed: {}", e),
                    }
                }

                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received, address monitor stopping");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(RESPAWN_DELAY_SECS)) => {}

                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received, address monitor stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn watch_once(&self) -> Result<()> {
        let mut child = Command::new("ip")
            .args(["-4", "monitor", "address"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::process("ip", format!("Failed to spawn monitor: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::process("ip", "monitor stdout not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            if !is_address_event(&line, &self.interface) {
                continue;
            }

            debug!("Address event: {}", line);
            if let Err(e) = self.pubsub.publish(&self.channel, line.trim()).await {
                warn!("Failed to publish address change: {}", e);
            }
        }

        let status = child.wait().await?;
        debug!("ip monitor exited with {}", status);
        Ok(())
    }
}

/// Whether a monitor line is an IPv4 address event on `interface`
///
/// Matches both additions (`3: eth0    inet 192.168.1.77/24 ...`) and removals
/// (`Deleted 3: eth0    inet ...`).
pub fn is_address_event(line: &str, interface: &str) -> bool {
    let mut tokens = line.split_whitespace();
    let mut first = tokens.next();
    if first == Some("Deleted") {
        first = tokens.next();
    }

    let Some(index) = first else {
        return false;
    };
    if !index.ends_with(':') {
        return false;
    }

    tokens.next() == Some(interface) && tokens.next() == Some("inet")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_event_filter() {
        assert!(is_address_event(
            "3: eth0    inet 192.168.1.77/24 brd 192.168.1.255 scope global eth0",
            "eth0"
        ));
        assert!(is_address_event(
            "Deleted 3: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global eth0",
            "eth0"
        ));
        assert!(!is_address_event(
            "4: wlan0    inet 10.0.0.5/24 scope global wlan0",
            "eth0"
        ));
        assert!(!is_address_event(
            "       valid_lft forever preferred_lft forever",
            "eth0"
        ));
        assert!(!is_address_event("", "eth0"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_monitor() {
        let bus = vpn_core::MemoryPubSub::new();
        let monitor = AddressMonitor::new(Arc::new(bus), "System:IPChange", "eth0");
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move { monitor.run_with_shutdown(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop within 5 seconds")
            .unwrap();
        assert!(result.is_ok());
    }
}
