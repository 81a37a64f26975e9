//! # Master Store
//!
//! Durable master records across coordinator restarts. The coordinator is
//! handed a store; it does not care how records are laid out.
//!
//! [`StoreListener`] keeps the store current by folding lifecycle events
//! into its own copy of the records, so persisting never needs to take an
//! entity lock.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::entity::{MasterRecord, TerminationRequest};
use super::organization::Organization;
use super::state::MasterState;
use crate::events::{EventListener, LifecycleEvent, ListenerError, MasterEvent};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt master store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Loads and saves master records.
pub trait MasterStore: Send + Sync {
    fn load(&self) -> StoreResult<Vec<MasterRecord>>;

    fn save(&self, records: &[MasterRecord]) -> StoreResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    masters: Vec<MasterRecord>,
}

const STORE_FILE_VERSION: u32 = 1;

/// JSON file store. Writes go to a sibling temp file that is renamed over
/// the original.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl MasterStore for JsonFileStore {
    fn load(&self) -> StoreResult<Vec<MasterRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        let file: StoreFile = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(file.masters)
    }

    fn save(&self, records: &[MasterRecord]) -> StoreResult<()> {
        let file = StoreFile {
            version: STORE_FILE_VERSION,
            masters: records.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        let mut out = fs::File::create(&tmp).map_err(|e| self.io_error(e))?;
        out.write_all(&bytes).map_err(|e| self.io_error(e))?;
        out.sync_all().map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

/// Store kept in memory, for tests and ephemeral coordinators.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<MasterRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MasterStore for MemoryStore {
    fn load(&self) -> StoreResult<Vec<MasterRecord>> {
        self.records
            .lock()
            .map(|r| r.clone())
            .map_err(|_| StoreError::Internal("Lock poisoned".into()))
    }

    fn save(&self, records: &[MasterRecord]) -> StoreResult<()> {
        let mut stored = self
            .records
            .lock()
            .map_err(|_| StoreError::Internal("Lock poisoned".into()))?;
        *stored = records.to_vec();
        Ok(())
    }
}

/// Receives a master's full record when its desired state changes
/// without a lifecycle transition (a queued provisioning or termination
/// request).
///
/// Callers hand over the record while holding the entity lock, so it is
/// never older than the last event fired for that entity.
pub trait RecordSink: Send + Sync {
    fn record_changed(&self, record: &MasterRecord) -> StoreResult<()>;
}

/// Persists master records as lifecycle events arrive.
pub struct StoreListener {
    store: Arc<dyn MasterStore>,
    records: Mutex<BTreeMap<Organization, MasterRecord>>,
}

impl StoreListener {
    /// Start from the records the registry was restored with.
    pub fn new(store: Arc<dyn MasterStore>, records: Vec<MasterRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.organization.clone(), r))
            .collect();
        Self {
            store,
            records: Mutex::new(records),
        }
    }

    fn apply(records: &mut BTreeMap<Organization, MasterRecord>, event: &MasterEvent) {
        if let MasterEvent::Created { organization, id } = event {
            records.insert(
                organization.clone(),
                MasterRecord {
                    id: *id,
                    organization: organization.clone(),
                    state: MasterState::Created,
                    endpoint: None,
                    identity_fingerprint: None,
                    provision_requested: false,
                    termination: None,
                    handle: None,
                    last_backend: None,
                    last_error: None,
                    created_at: chrono::Utc::now(),
                },
            );
            return;
        }

        let Some(record) = records.get_mut(event.organization()) else {
            return;
        };
        match event {
            MasterEvent::Created { .. } => {}
            MasterEvent::Provisioning { backend, .. } => {
                record.state = MasterState::Provisioning;
                record.provision_requested = false;
                record.last_backend = Some(backend.clone());
            }
            MasterEvent::Provisioned {
                endpoint, handle, ..
            } => {
                record.state = MasterState::Provisioned;
                record.endpoint = Some(endpoint.clone());
                record.handle = Some(handle.clone());
                record.last_error = None;
            }
            MasterEvent::Approved { fingerprint, .. } => {
                record.state = MasterState::Approved;
                record.identity_fingerprint = Some(fingerprint.clone());
            }
            MasterEvent::ProvisioningFailed { backend, error, .. } => {
                record.state = MasterState::ProvisioningFailed;
                record.last_backend = backend.clone();
                record.last_error = Some(error.clone());
            }
            MasterEvent::Disconnected { .. } => record.state = MasterState::Provisioned,
            MasterEvent::Terminating { forced, .. } => {
                record.state = MasterState::Terminating;
                record.provision_requested = false;
                record.termination = Some(TerminationRequest { forced: *forced });
            }
            MasterEvent::Terminated { .. } => {
                record.state = MasterState::Terminated;
                record.termination = None;
                record.handle = None;
            }
        }
    }
}

impl EventListener for StoreListener {
    fn name(&self) -> &str {
        "store"
    }

    fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError> {
        let LifecycleEvent::Master(event) = event else {
            return Ok(());
        };
        let mut records = self
            .records
            .lock()
            .map_err(|_| ListenerError::Failed("Lock poisoned".into()))?;
        Self::apply(&mut records, event);
        let snapshot: Vec<MasterRecord> = records.values().cloned().collect();
        self.store
            .save(&snapshot)
            .map_err(|e| ListenerError::Failed(e.to_string()))
    }
}

impl RecordSink for StoreListener {
    fn record_changed(&self, record: &MasterRecord) -> StoreResult<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Internal("Lock poisoned".into()))?;
        records.insert(record.organization.clone(), record.clone());
        let snapshot: Vec<MasterRecord> = records.values().cloned().collect();
        self.store.save(&snapshot)
    }
}
