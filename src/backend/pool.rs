//! # Pooled Backend
//!
//! Capacity-bounded adapter over a [`MasterProvisioningService`]. Cloud
//! pools and node-property pools share the same contract; they differ only
//! in how they are named and configured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::errors::{BackendError, BackendResult};
use super::service::MasterProvisioningService;
use super::{InstanceHandle, ProvisionedInstance, ProvisioningBackend};
use crate::master::Organization;

/// Where a pool's capacity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolKind {
    /// A cloud allocating fresh instances.
    Cloud { name: String },
    /// Nodes carrying a provisioning property, selected by label.
    Node { label: String },
}

impl PoolKind {
    pub fn name(&self) -> &str {
        match self {
            PoolKind::Cloud { name } => name,
            PoolKind::Node { label } => label,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            PoolKind::Cloud { .. } => "cloud",
            PoolKind::Node { .. } => "node",
        }
    }
}

/// A capacity-bounded provisioning backend.
pub struct PooledBackend {
    kind: PoolKind,
    capacity: usize,
    start_timeout: Option<Duration>,
    service: Arc<dyn MasterProvisioningService>,
}

impl std::fmt::Debug for PooledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBackend")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("start_timeout", &self.start_timeout)
            .finish()
    }
}

impl PooledBackend {
    pub fn cloud(
        name: impl Into<String>,
        capacity: usize,
        service: Arc<dyn MasterProvisioningService>,
    ) -> Self {
        Self::new(PoolKind::Cloud { name: name.into() }, capacity, service)
    }

    pub fn node(
        label: impl Into<String>,
        capacity: usize,
        service: Arc<dyn MasterProvisioningService>,
    ) -> Self {
        Self::new(PoolKind::Node { label: label.into() }, capacity, service)
    }

    pub fn new(kind: PoolKind, capacity: usize, service: Arc<dyn MasterProvisioningService>) -> Self {
        Self {
            kind,
            capacity,
            start_timeout: None,
            service,
        }
    }

    /// Fail starts that take longer than `timeout`.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> &PoolKind {
        &self.kind
    }
}

#[async_trait]
impl ProvisioningBackend for PooledBackend {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn start_instance(&self, organization: &Organization) -> BackendResult<ProvisionedInstance> {
        let handle = InstanceHandle::new(self.name(), organization.clone());
        debug!(backend = self.name(), %organization, instance = %handle.id, "starting instance");

        let endpoint = match self.start_timeout {
            None => self.service.provision(&handle).await?,
            Some(limit) => match tokio::time::timeout(limit, self.service.provision(&handle)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(backend = self.name(), %organization, "instance start timed out");
                    // The launch may still land; make sure it does not linger.
                    let service = self.service.clone();
                    let orphan = handle.clone();
                    tokio::spawn(async move {
                        let _ = service.terminate(&orphan, false).await;
                    });
                    return Err(BackendError::Timeout {
                        backend: self.name().to_string(),
                        after_ms: limit.as_millis() as u64,
                    });
                }
            },
        };

        Ok(ProvisionedInstance { handle, endpoint })
    }

    async fn stop_instance(&self, handle: &InstanceHandle, graceful: bool) -> BackendResult<()> {
        if handle.backend != self.name() {
            return Err(BackendError::UnknownInstance(format!(
                "{} belongs to backend {}",
                handle.id, handle.backend
            )));
        }
        debug!(backend = self.name(), organization = %handle.organization, graceful, "stopping instance");
        self.service.terminate(handle, graceful).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedProvisioningService;

    fn org() -> Organization {
        Organization::new("org0").unwrap()
    }

    #[tokio::test]
    async fn test_start_issues_handle_for_backend() {
        let service = Arc::new(SimulatedProvisioningService::new(Duration::ZERO));
        let backend = PooledBackend::cloud("cloud-a", 4, service.clone());

        let instance = backend.start_instance(&org()).await.unwrap();
        assert_eq!(instance.handle.backend, "cloud-a");
        assert_eq!(instance.handle.organization, org());
        assert!(instance.endpoint.contains("org0"));
        assert_eq!(service.stats().running, 1);

        backend.stop_instance(&instance.handle, true).await.unwrap();
        assert_eq!(service.stats().running, 0);
    }

    #[tokio::test]
    async fn test_node_pool_has_same_contract() {
        let service = Arc::new(SimulatedProvisioningService::new(Duration::ZERO));
        let backend = PooledBackend::node("masters", 2, service);
        assert_eq!(backend.kind().kind_str(), "node");
        assert_eq!(backend.capacity(), 2);

        let instance = backend.start_instance(&org()).await.unwrap();
        assert_eq!(instance.handle.backend, "masters");
    }

    #[tokio::test]
    async fn test_start_timeout() {
        let service = Arc::new(SimulatedProvisioningService::new(Duration::from_secs(5)));
        let backend = PooledBackend::cloud("slow", 1, service)
            .with_start_timeout(Duration::from_millis(20));

        let err = backend.start_instance(&org()).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_rejects_foreign_handles() {
        let service = Arc::new(SimulatedProvisioningService::new(Duration::ZERO));
        let backend = PooledBackend::cloud("cloud-a", 1, service);
        let foreign = InstanceHandle::new("cloud-b", org());

        let err = backend.stop_instance(&foreign, true).await.unwrap_err();
        assert!(matches!(err, BackendError::UnknownInstance(_)));
    }
}
