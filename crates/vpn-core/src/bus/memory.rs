// # Memory Pub/Sub
//
// In-process implementation of PubSub backed by one tokio broadcast channel
// per channel name.
//
// ## Delivery
//
// - Messages published before a subscription exists are not replayed
// - A subscriber that falls more than `capacity` messages behind skips the
//   oldest ones (logged) instead of blocking publishers
// - Dropping a subscription stream unsubscribes it

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::Error;
use crate::traits::pubsub::{MessageStream, PubSub};

/// Default per-channel buffer
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// In-memory pub/sub implementation
///
/// Cloning yields another handle onto the same set of channels.
///
/// # Example
///
/// ```rust,no_run
/// use vpn_core::bus::MemoryPubSub;
/// use vpn_core::traits::PubSub;
/// use tokio_stream::StreamExt;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let bus = MemoryPubSub::new();
///     let mut changes = bus.subscribe("System:IPChange");
///
///     bus.publish("System:IPChange", "").await?;
///     assert_eq!(changes.next().await.as_deref(), Some(""));
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryPubSub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl MemoryPubSub {
    /// Create a new bus with the default per-channel capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new bus with a custom per-channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        // The map holds no invariants a panicking holder could break.
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), Error> {
        match self.sender(channel).send(message.to_string()) {
            Ok(receivers) => debug!("Published on {} to {} subscriber(s)", channel, receivers),
            Err(_) => debug!("Published on {} with no subscribers", channel),
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> MessageStream {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(message) => Some(message),
            Err(err) => {
                warn!("Subscriber on {} dropped messages: {}", channel, err);
                None
            }
        });

        Box::pin(stream)
    }
}
