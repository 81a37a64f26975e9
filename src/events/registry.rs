//! # Listener Registry
//!
//! Ordered set of observers. Built explicitly at startup and appendable
//! afterwards. Delivery is synchronous with the transition being reported,
//! in registration order.
//!
//! A listener that errors or panics is reported and skipped; the
//! transition it observed has already committed and is never undone.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use super::event::{ConnectionEvent, LifecycleEvent, MasterEvent};

/// Default threshold above which a listener is reported as slow.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(250);

/// Error returned by a listener.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),

    #[error("listener panicked: {0}")]
    Panicked(String),
}

/// An observer of lifecycle and connection events.
///
/// Implementations must be fast and must not call back into the registry
/// that delivers to them; the entity being reported is locked during
/// delivery.
pub trait EventListener: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Observe one event.
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError>;
}

/// Outcome of delivering one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FireReport {
    /// Listeners that returned `Ok`
    pub delivered: usize,
    /// Listeners that errored or panicked
    pub failed: usize,
    /// Listeners that exceeded the slow threshold
    pub slow: usize,
}

/// Ordered, append-friendly listener collection.
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    slow_threshold: Duration,
    failures: AtomicU64,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.names())
            .field("slow_threshold", &self.slow_threshold)
            .finish()
    }
}

impl ListenerRegistry {
    /// Create a registry with an initial, ordered membership.
    pub fn new(listeners: Vec<Arc<dyn EventListener>>) -> Self {
        Self {
            listeners: RwLock::new(listeners),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            failures: AtomicU64::new(0),
        }
    }

    /// Set the slow-listener threshold.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Append a listener. It sees events fired after this call.
    pub fn register(&self, listener: Arc<dyn EventListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Listener names in delivery order.
    pub fn names(&self) -> Vec<String> {
        self.listeners
            .read()
            .map(|l| l.iter().map(|l| l.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total listener failures since creation.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver an event to every listener in order.
    pub fn fire(&self, event: impl Into<LifecycleEvent>) -> FireReport {
        let event = event.into();
        let listeners: Vec<Arc<dyn EventListener>> = match self.listeners.read() {
            Ok(l) => l.clone(),
            Err(_) => return FireReport::default(),
        };

        let mut report = FireReport::default();
        for listener in listeners {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)))
                .unwrap_or_else(|payload| Err(ListenerError::Panicked(panic_message(payload))));
            let elapsed = started.elapsed();

            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        listener = listener.name(),
                        event = event.event_name(),
                        error = %err,
                        "event listener failed"
                    );
                }
            }

            if elapsed > self.slow_threshold {
                report.slow += 1;
                warn!(
                    listener = listener.name(),
                    event = event.event_name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow event listener"
                );
            }
        }
        report
    }

    pub fn fire_master(&self, event: MasterEvent) -> FireReport {
        self.fire(event)
    }

    pub fn fire_connection(&self, event: ConnectionEvent) -> FireReport {
        self.fire(event)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
