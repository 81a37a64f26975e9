//! # Event Listener Registry
//!
//! Observers of master lifecycle transitions and agent connection progress.
//! Membership is assembled explicitly at startup; there is no discovery.

mod event;
mod listeners;
mod registry;

pub use event::{ConnectionEvent, LifecycleEvent, MasterEvent};
pub use listeners::{EventBus, EventRecorder, LoggingListener, RecordedEvent};
pub use registry::{EventListener, FireReport, ListenerError, ListenerRegistry, DEFAULT_SLOW_THRESHOLD};
