//! # Master Registry
//!
//! Organization -> entity map. The map lock is only held to look entities
//! up; every state change happens under the entity's own lock so that the
//! reconciliation pass and the connection callbacks serialize per entity.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::entity::{MasterRecord, MasterServer, MasterSnapshot};
use super::errors::{MasterError, MasterResult};
use super::organization::Organization;
use super::state::MasterState;

/// Shared handle to one entity.
pub type MasterRef = Arc<Mutex<MasterServer>>;

/// Lock an entity, mapping poisoning to an internal error.
pub fn lock_master(master: &MasterRef) -> MasterResult<MutexGuard<'_, MasterServer>> {
    master.lock().map_err(|_| MasterError::poisoned())
}

/// In-memory registry of every master the coordinator knows about.
#[derive(Debug, Default)]
pub struct MasterRegistry {
    masters: RwLock<BTreeMap<Organization, MasterRef>>,
}

impl MasterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a master record for `organization`.
    ///
    /// A terminated record is replaced; any other existing record is an
    /// error.
    pub fn create(&self, organization: Organization) -> MasterResult<MasterRef> {
        let mut masters = self.masters.write().map_err(|_| MasterError::poisoned())?;
        if let Some(existing) = masters.get(&organization) {
            if lock_master(existing)?.state() != MasterState::Terminated {
                return Err(MasterError::AlreadyExists(organization.to_string()));
            }
        }
        let master = Arc::new(Mutex::new(MasterServer::new(organization.clone())));
        masters.insert(organization, master.clone());
        Ok(master)
    }

    /// Re-insert persisted records. Existing organizations are left alone.
    pub fn restore(&self, records: Vec<MasterRecord>) -> MasterResult<usize> {
        let mut masters = self.masters.write().map_err(|_| MasterError::poisoned())?;
        let mut restored = 0;
        for record in records {
            if masters.contains_key(&record.organization) {
                continue;
            }
            let organization = record.organization.clone();
            masters.insert(
                organization,
                Arc::new(Mutex::new(MasterServer::from_record(record))),
            );
            restored += 1;
        }
        Ok(restored)
    }

    /// Look up a master by organization.
    pub fn get(&self, organization: &Organization) -> MasterResult<MasterRef> {
        self.masters
            .read()
            .map_err(|_| MasterError::poisoned())?
            .get(organization)
            .cloned()
            .ok_or_else(|| MasterError::NotFound(organization.to_string()))
    }

    /// All masters in organization order.
    pub fn all(&self) -> Vec<MasterRef> {
        self.masters
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot every master.
    pub fn snapshots(&self) -> MasterResult<Vec<MasterSnapshot>> {
        self.all()
            .iter()
            .map(|m| lock_master(m).map(|m| m.snapshot()))
            .collect()
    }

    /// Durable records for every master.
    pub fn records(&self) -> MasterResult<Vec<MasterRecord>> {
        self.all()
            .iter()
            .map(|m| lock_master(m).map(|m| m.record()))
            .collect()
    }

    /// Masters whose instance exists and has not been confirmed gone.
    pub fn provisioned(&self) -> MasterResult<Vec<MasterSnapshot>> {
        Ok(self
            .snapshots()?
            .into_iter()
            .filter(|s| s.state.is_provisioned())
            .collect())
    }

    /// Number of masters
    pub fn len(&self) -> usize {
        self.masters.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
