//! Timeout-bounded router port mapping
//!
//! The [`PortMappingGuard`] wraps a [`PortMapper`] so callers can await router
//! calls without risking an indefinite hang.
//!
//! ## Exactly-once completion
//!
//! Each call races the router future against a fixed timer. Whichever finishes
//! first decides the single outcome the caller sees. When the timer wins, the
//! router future is dropped, which cancels it: a router answer that would have
//! arrived later is never observed, so it can never contradict the timeout
//! branch the caller already acted on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::traits::{PortMapper, Protocol};

/// Port pair to map on the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingRequest {
    /// Transport protocol
    pub protocol: Protocol,
    /// Port the service listens on inside the LAN
    pub local_port: u16,
    /// Port exposed on the router
    pub external_port: u16,
}

impl MappingRequest {
    /// Map `port` to itself
    pub fn symmetric(protocol: Protocol, port: u16) -> Self {
        Self {
            protocol,
            local_port: port,
            external_port: port,
        }
    }
}

/// Successful outcome of a guarded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOutcome {
    /// Router accepted the mapping
    Added(MappingRequest),
    /// Router removed the mapping
    Removed(MappingRequest),
}

/// Wraps router calls with a hard timeout
pub struct PortMappingGuard {
    mapper: Arc<dyn PortMapper>,
    timeout: Duration,
}

impl PortMappingGuard {
    /// Create a guard bounding every call by `timeout`
    pub fn new(mapper: Arc<dyn PortMapper>, timeout: Duration) -> Self {
        Self { mapper, timeout }
    }

    /// The bound applied to each call
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a mapping
    ///
    /// # Returns
    ///
    /// - `Ok(MappingOutcome::Added)`: Router accepted the mapping in time
    /// - `Err(Error::Mapping)`: Router rejected the mapping
    /// - `Err(Error::Timeout)`: No answer within the bound
    pub async fn add_mapping(
        &self,
        request: MappingRequest,
        description: &str,
    ) -> Result<MappingOutcome> {
        info!(
            "Adding {} port mapping {} -> {} via {} ({})",
            request.protocol,
            request.external_port,
            request.local_port,
            self.mapper.mapper_name(),
            description
        );

        let call = self.mapper.add_mapping(
            request.protocol,
            request.local_port,
            request.external_port,
            description,
        );

        self.bounded("add", call).await?;
        Ok(MappingOutcome::Added(request))
    }

    /// Remove a mapping
    ///
    /// Same outcome contract as [`PortMappingGuard::add_mapping`].
    pub async fn remove_mapping(&self, request: MappingRequest) -> Result<MappingOutcome> {
        info!(
            "Removing {} port mapping {} -> {} via {}",
            request.protocol,
            request.external_port,
            request.local_port,
            self.mapper.mapper_name()
        );

        let call = self.mapper.remove_mapping(
            request.protocol,
            request.local_port,
            request.external_port,
        );

        self.bounded("remove", call).await?;
        Ok(MappingOutcome::Removed(request))
    }

    async fn bounded<F>(&self, operation: &str, call: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::Mapping(message))) => Err(Error::Mapping(message)),
            Ok(Err(other)) => Err(Error::mapping(other.to_string())),
            Err(_elapsed) => {
                error!("Failed to {} port mapping due to timeout", operation);
                Err(Error::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    enum Behavior {
        Succeed,
        Fail,
        Hang,
        AnswerAfter(Duration),
    }

    struct FakeMapper {
        behavior: Behavior,
        answered: Arc<AtomicBool>,
    }

    impl FakeMapper {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                answered: Arc::new(AtomicBool::new(false)),
            }
        }

        async fn respond(&self) -> Result<()> {
            match self.behavior {
                Behavior::Succeed => {}
                Behavior::Fail => return Err(Error::process("upnpc", "no IGD found")),
                Behavior::Hang => std::future::pending::<()>().await,
                Behavior::AnswerAfter(delay) => tokio::time::sleep(delay).await,
            }
            self.answered.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl PortMapper for FakeMapper {
        async fn add_mapping(&self, _: Protocol, _: u16, _: u16, _: &str) -> Result<()> {
            self.respond().await
        }

        async fn remove_mapping(&self, _: Protocol, _: u16, _: u16) -> Result<()> {
            self.respond().await
        }

        fn mapper_name(&self) -> &'static str {
            "fake"
        }
    }

    fn request() -> MappingRequest {
        MappingRequest::symmetric(Protocol::Udp, 1194)
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let guard = PortMappingGuard::new(
            Arc::new(FakeMapper::new(Behavior::Succeed)),
            Duration::from_millis(100),
        );

        assert_eq!(
            guard.add_mapping(request(), "OpenVPN").await.unwrap(),
            MappingOutcome::Added(request())
        );
        assert_eq!(
            guard.remove_mapping(request()).await.unwrap(),
            MappingOutcome::Removed(request())
        );
    }

    #[tokio::test]
    async fn test_router_error_becomes_mapping_error() {
        let guard = PortMappingGuard::new(
            Arc::new(FakeMapper::new(Behavior::Fail)),
            Duration::from_millis(100),
        );

        let err = guard.add_mapping(request(), "OpenVPN").await.unwrap_err();
        assert!(matches!(err, Error::Mapping(ref m) if m.contains("no IGD found")));
    }

    #[tokio::test]
    async fn test_hanging_router_times_out() {
        let timeout = Duration::from_millis(30);
        let guard = PortMappingGuard::new(Arc::new(FakeMapper::new(Behavior::Hang)), timeout);

        let err = guard.remove_mapping(request()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, Error::Timeout(t) if t == timeout));
    }

    #[tokio::test]
    async fn test_late_answer_is_discarded() {
        let mapper = FakeMapper::new(Behavior::AnswerAfter(Duration::from_millis(150)));
        let answered = mapper.answered.clone();
        let guard = PortMappingGuard::new(Arc::new(mapper), Duration::from_millis(20));

        let result = guard.add_mapping(request(), "OpenVPN").await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(
            !answered.load(Ordering::SeqCst),
            "router future must be cancelled once the timeout fires"
        );
    }
}
