//! Master provisioning services

use async_trait::async_trait;

use super::errors::BackendResult;
use super::InstanceHandle;

/// Something that actually launches a master: a cloud API, a node agent,
/// an in-process simulation.
#[async_trait]
pub trait MasterProvisioningService: Send + Sync {
    /// Launch the master identified by `handle` and return its endpoint.
    async fn provision(&self, handle: &InstanceHandle) -> BackendResult<String>;

    /// Tear the master down. Stopping an unknown instance succeeds.
    async fn terminate(&self, handle: &InstanceHandle, graceful: bool) -> BackendResult<()>;
}
