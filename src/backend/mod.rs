//! # Provisioning Backends
//!
//! Capacity-bounded strategies that start and stop single master instances.
//! Backends never see a master entity; they get an organization to start
//! and hand back an opaque [`InstanceHandle`] to stop later.

mod errors;
mod pool;
mod service;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::master::Organization;

pub use errors::{BackendError, BackendResult};
pub use pool::{PoolKind, PooledBackend};
pub use service::MasterProvisioningService;
pub use simulated::{AgentTarget, SimulatedProvisioningService, SimulatedStats};

/// Opaque reference to a running instance, issued by the backend that
/// started it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: Uuid,
    pub backend: String,
    pub organization: Organization,
}

impl InstanceHandle {
    pub fn new(backend: impl Into<String>, organization: Organization) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend: backend.into(),
            organization,
        }
    }
}

/// A started instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub handle: InstanceHandle,
    /// URL the master is reachable at.
    pub endpoint: String,
}

/// Starts and stops master instances.
///
/// The scheduler runs each call on its own task and receives the result on
/// a completion channel, so implementations may take as long as they need.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Stable name, unique among registered backends.
    fn name(&self) -> &str;

    /// Maximum starts this backend may have in flight at once.
    fn capacity(&self) -> usize;

    /// Start an instance for `organization`.
    async fn start_instance(&self, organization: &Organization) -> BackendResult<ProvisionedInstance>;

    /// Stop a previously started instance.
    async fn stop_instance(&self, handle: &InstanceHandle, graceful: bool) -> BackendResult<()>;
}
