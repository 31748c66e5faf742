// # vpn-core
//
// Core library for the VPN server lifecycle controller.
//
// ## Architecture Overview
//
// This library owns the lifecycle of a host-side OpenVPN server:
// - **Firewall / PortMapper / ServiceControl / HostNetwork**: Traits for the
//   external systems the server depends on
// - **PubSub**: Trait for the notification transport
// - **ProcessRunner**: Trait for running the install/config script tool-chain
// - **NatReconciler**: Keeps exactly one SNAT rule for the VPN subnet
// - **PortMappingGuard**: Router port mapping bounded by a timeout
// - **LifecycleController**: Install, configure, start, stop
// - **IpChangeReactor**: Re-applies NAT when the host address changes
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic is separate from host adapters
// 2. **Event-Driven**: Address changes arrive as pub/sub notifications
// 3. **Serialized Side Effects**: NAT rule edits never interleave
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Bounded Waits**: No router call can hang a lifecycle operation

pub mod bus;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod mapping;
pub mod nat;
pub mod process;
pub mod reactor;
pub mod state;
pub mod traits;

// Re-export core types for convenience
pub use bus::MemoryPubSub;
pub use config::VpnConfig;
pub use controller::{
    Collaborators, ConfigureOptions, ControllerEvent, LifecycleController, ServerStatus,
    StartOutcome,
};
pub use credentials::{ClientProfile, ClientProfileStore, ProfileRequest};
pub use error::{Error, Result};
pub use mapping::{MappingOutcome, MappingRequest, PortMappingGuard};
pub use nat::{NatReconciler, ReconcileOutcome};
pub use process::{Invocation, ProcessOutput, ProcessRunner, SystemProcessRunner};
pub use reactor::IpChangeReactor;
pub use state::{LifecycleStage, ServerState, StatusSnapshot};
pub use traits::{Firewall, HostNetwork, PortMapper, PubSub, ServiceControl};
