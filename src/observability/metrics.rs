//! Fleet counters
//!
//! - Counters are monotonic and reset only on process start
//! - `connected_masters` is a gauge maintained from connect/disconnect events
//! - Thread-safe, relaxed atomics; exactness across counters is not promised

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::events::{ConnectionEvent, EventListener, LifecycleEvent, ListenerError, MasterEvent};

/// Counters describing what the fleet has done since start.
#[derive(Debug, Default)]
pub struct FleetMetrics {
    masters_created: AtomicU64,
    provisioning_started: AtomicU64,
    provisioned: AtomicU64,
    provisioning_failed: AtomicU64,
    approved: AtomicU64,
    disconnected: AtomicU64,
    terminated: AtomicU64,
    connection_refusals: AtomicU64,
    connection_errors: AtomicU64,
    security_errors: AtomicU64,
    connected_masters: AtomicI64,
}

impl FleetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one lifecycle event.
    pub fn record(&self, event: &LifecycleEvent) {
        let counter = match event {
            LifecycleEvent::Master(MasterEvent::Created { .. }) => &self.masters_created,
            LifecycleEvent::Master(MasterEvent::Provisioning { .. }) => &self.provisioning_started,
            LifecycleEvent::Master(MasterEvent::Provisioned { .. }) => &self.provisioned,
            LifecycleEvent::Master(MasterEvent::ProvisioningFailed { .. }) => {
                &self.provisioning_failed
            }
            LifecycleEvent::Master(MasterEvent::Approved { .. }) => {
                self.connected_masters.fetch_add(1, Ordering::Relaxed);
                &self.approved
            }
            LifecycleEvent::Master(MasterEvent::Disconnected { .. }) => {
                self.connected_masters.fetch_sub(1, Ordering::Relaxed);
                &self.disconnected
            }
            LifecycleEvent::Master(MasterEvent::Terminated { .. }) => &self.terminated,
            LifecycleEvent::Master(MasterEvent::Terminating { .. }) => return,
            LifecycleEvent::Connection(ConnectionEvent::Refusal(_)) => &self.connection_refusals,
            LifecycleEvent::Connection(ConnectionEvent::Error { security, .. }) => {
                if *security {
                    self.security_errors.fetch_add(1, Ordering::Relaxed);
                }
                &self.connection_errors
            }
            LifecycleEvent::Connection(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Approved masters minus disconnects. Channels closed by termination
    /// are not reported as disconnects, so this is an upper bound.
    pub fn connected_masters(&self) -> u64 {
        self.connected_masters.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            masters_created: self.masters_created.load(Ordering::Relaxed),
            provisioning_started: self.provisioning_started.load(Ordering::Relaxed),
            provisioned: self.provisioned.load(Ordering::Relaxed),
            provisioning_failed: self.provisioning_failed.load(Ordering::Relaxed),
            approved: self.approved.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            terminated: self.terminated.load(Ordering::Relaxed),
            connection_refusals: self.connection_refusals.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            security_errors: self.security_errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub masters_created: u64,
    pub provisioning_started: u64,
    pub provisioned: u64,
    pub provisioning_failed: u64,
    pub approved: u64,
    pub disconnected: u64,
    pub terminated: u64,
    pub connection_refusals: u64,
    pub connection_errors: u64,
    pub security_errors: u64,
}

/// Feeds [`FleetMetrics`] from the listener registry.
#[derive(Debug, Clone)]
pub struct MetricsListener {
    metrics: Arc<FleetMetrics>,
}

impl MetricsListener {
    pub fn new(metrics: Arc<FleetMetrics>) -> Self {
        Self { metrics }
    }
}

impl EventListener for MetricsListener {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError> {
        self.metrics.record(event);
        Ok(())
    }
}
