//! # Master Entities
//!
//! Records of tenant masters, their lifecycle state machine, the registry
//! that owns them and the store that persists them.

mod entity;
mod errors;
mod organization;
mod registry;
mod state;
mod store;

pub use entity::{MasterRecord, MasterServer, MasterSnapshot, TerminationRequest};
pub use errors::{MasterError, MasterResult};
pub use organization::Organization;
pub use registry::{lock_master, MasterRef, MasterRegistry};
pub use state::MasterState;
pub use store::{
    JsonFileStore, MasterStore, MemoryStore, RecordSink, StoreError, StoreListener, StoreResult,
};
