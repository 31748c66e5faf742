// # Pub/Sub Implementations
//
// This module provides implementations of the PubSub trait.

pub mod memory;

pub use memory::MemoryPubSub;
