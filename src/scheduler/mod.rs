//! # Lifecycle Scheduler
//!
//! Drives master entities from provisioning requests to running instances
//! and back down again, within each backend's concurrency limit.

mod cadence;
mod capacity;
mod clock;
mod errors;
mod provisioner;
mod retry;

pub use cadence::{Cadence, CadenceHandle, DEFAULT_INITIAL_DELAY, DEFAULT_RECURRENCE_PERIOD};
pub use capacity::{BackendStatus, CapacityCounter};
pub use clock::{Clock, ManualClock, TokioClock};
pub use errors::{SchedulerError, SchedulerResult};
pub use provisioner::{MasterProvisioner, SchedulerSettings};
pub use retry::RetryPolicy;
