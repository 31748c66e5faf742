//! Host address change reactor
//!
//! Listens on the IP-change channel and asks the [`LifecycleController`] to
//! re-apply the NAT rule for the host's new address.
//!
//! ## Event Flow
//!
//! 1. Notification arrives (payload ignored)
//! 2. Controller reads its running flag and server network
//! 3. If running, the NAT rule is re-applied for the current host address
//! 4. Failures are logged; the reactor keeps listening
//!
//! Notifications are handled one at a time in arrival order.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::controller::LifecycleController;
use crate::error::Result;
use crate::nat::ReconcileOutcome;
use crate::traits::PubSub;

/// Re-applies NAT when the host address changes
pub struct IpChangeReactor {
    controller: Arc<LifecycleController>,
    pubsub: Arc<dyn PubSub>,
    channel: String,
}

impl IpChangeReactor {
    /// Create a reactor listening on the controller's configured channel
    pub fn new(controller: Arc<LifecycleController>, pubsub: Arc<dyn PubSub>) -> Self {
        let channel = controller.config().bus.ip_change_channel.clone();
        Self {
            controller,
            pubsub,
            channel,
        }
    }

    /// Channel this reactor listens on
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Run until SIGINT
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run until `shutdown_rx` fires (or SIGINT when `None`)
    ///
    /// Used by the daemon to stop the reactor before tearing the server down,
    /// and by tests that need a deterministic shutdown.
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let mut notifications = self.pubsub.subscribe(&self.channel);
        info!("Listening for host address changes on {}", self.channel);

        if let Some(mut rx) = shutdown_rx {
            loop {
                tokio::select! {
                    Some(_) = notifications.next() => self.handle_change().await,

                    _ = &mut rx => {
                        info!("Shutdown signal received, IP change reactor stopping");
                        break;
                    }
                }
            }
        } else {
            loop {
                tokio::select! {
                    Some(_) = notifications.next() => self.handle_change().await,

                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received, IP change reactor stopping");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_change(&self) {
        debug!("Host address change notification received");

        match self.controller.reconcile_current_address().await {
            Ok(ReconcileOutcome::Applied(rule)) => {
                info!("NAT rule re-applied after address change: {}", rule)
            }
            Ok(_) => debug!("Nothing to reconcile after address change"),
            Err(e) => error!("Failed to reconcile NAT rule after address change: {}", e),
        }
    }
}
