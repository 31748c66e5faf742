// # Pub/Sub Trait
//
// Generic publish/subscribe capability used to receive host-address-change
// notifications and to announce subnet changes.
//
// ## Implementations
//
// - In-process broadcast bus: [`crate::bus::MemoryPubSub`]

use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

/// Stream of message payloads on one channel
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send + 'static>>;

/// Trait for publish/subscribe transports
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `message` on `channel`
    ///
    /// Publishing to a channel without subscribers is not an error.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), crate::Error>;

    /// Subscribe to `channel`
    ///
    /// The stream yields every message published after this call returns and
    /// ends only when the transport shuts down.
    fn subscribe(&self, channel: &str) -> MessageStream;
}
