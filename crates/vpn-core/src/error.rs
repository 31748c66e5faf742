//! Error types for the VPN lifecycle controller
//!
//! This module defines all error types used throughout the crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for VPN lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the VPN lifecycle controller
#[derive(Error, Debug)]
pub enum Error {
    /// External install sequence failed
    #[error("Install failed for instance {instance}: {message}")]
    Install {
        /// Instance being installed
        instance: String,
        /// Failure detail
        message: String,
    },

    /// Server configuration generation failed
    #[error("Config generation failed: {0}")]
    ConfigGeneration(String),

    /// Start attempted before the server instance exists
    #[error("Server instance is not installed yet")]
    NotInstalled,

    /// Service start/restart command failed
    #[error("Service start failed: {0}")]
    ServiceStart(String),

    /// Service stop command failed
    #[error("Service stop failed: {0}")]
    ServiceStop(String),

    /// NAT rule could not be installed
    #[error("NAT rule apply failed: {0}")]
    NatRuleApply(String),

    /// NAT rule could not be removed
    #[error("NAT rule unapply failed: {0}")]
    NatRuleUnapply(String),

    /// Router-control port mapping call failed
    #[error("Port mapping error: {0}")]
    Mapping(String),

    /// Router-control port mapping call exceeded its time bound
    #[error("Port mapping timed out after {0:?}")]
    Timeout(Duration),

    /// Advisory lock already held by another invocation
    #[error("Lock {path} is held by another process")]
    Lock {
        /// Path of the lock file
        path: String,
    },

    /// External process could not be spawned or exited unsuccessfully
    #[error("Process {program} failed: {message}")]
    Process {
        /// Program that was invoked
        program: String,
        /// Failure detail
        message: String,
    },

    /// Client profile could not be produced
    #[error("Client profile error: {0}")]
    Credential(String),

    /// Host network snapshot unavailable
    #[error("Host network error: {0}")]
    HostNetwork(String),

    /// Publish/subscribe transport errors
    #[error("Pub/sub error: {0}")]
    PubSub(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an install error
    pub fn install(instance: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Install {
            instance: instance.into(),
            message: message.into(),
        }
    }

    /// Create a config generation error
    pub fn config_generation(msg: impl Into<String>) -> Self {
        Self::ConfigGeneration(msg.into())
    }

    /// Create a service start error
    pub fn service_start(msg: impl Into<String>) -> Self {
        Self::ServiceStart(msg.into())
    }

    /// Create a service stop error
    pub fn service_stop(msg: impl Into<String>) -> Self {
        Self::ServiceStop(msg.into())
    }

    /// Create a NAT apply error
    pub fn nat_apply(msg: impl Into<String>) -> Self {
        Self::NatRuleApply(msg.into())
    }

    /// Create a NAT unapply error
    pub fn nat_unapply(msg: impl Into<String>) -> Self {
        Self::NatRuleUnapply(msg.into())
    }

    /// Create a port mapping error
    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    /// Create a lock contention error
    pub fn lock(path: impl Into<String>) -> Self {
        Self::Lock { path: path.into() }
    }

    /// Create a process failure error
    pub fn process(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Process {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Create a client profile error
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a host network error
    pub fn host_network(msg: impl Into<String>) -> Self {
        Self::HostNetwork(msg.into())
    }

    /// Create a pub/sub error
    pub fn pubsub(msg: impl Into<String>) -> Self {
        Self::PubSub(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error came from the port mapping guard's time bound
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
