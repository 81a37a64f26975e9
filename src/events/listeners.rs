//! Built-in event listeners

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::event::{ConnectionEvent, LifecycleEvent, MasterEvent};
use super::registry::{EventListener, ListenerError};
use crate::master::Organization;

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError> {
        match event {
            LifecycleEvent::Master(MasterEvent::ProvisioningFailed {
                organization,
                backend,
                error,
                attempts,
            }) => warn!(
                %organization,
                backend = backend.as_deref().unwrap_or("-"),
                attempts,
                error = %error,
                "master provisioning failed"
            ),
            LifecycleEvent::Master(e) => info!(
                organization = %e.organization(),
                event = e.event_name(),
                "master lifecycle"
            ),
            LifecycleEvent::Connection(ConnectionEvent::Error {
                organization,
                address,
                security,
                message,
                ..
            }) => warn!(
                organization = organization.as_ref().map(Organization::as_str).unwrap_or("-"),
                %address,
                security,
                error = %message,
                "agent connection error"
            ),
            LifecycleEvent::Connection(ConnectionEvent::Refusal(refusal)) => info!(
                organization = refusal
                    .organization
                    .as_ref()
                    .map(Organization::as_str)
                    .unwrap_or("-"),
                reason = %refusal.reason,
                remote = refusal.remote,
                "agent connection refused"
            ),
            LifecycleEvent::Connection(e) => info!(
                organization = e.organization().map(Organization::as_str).unwrap_or("-"),
                event = e.event_name(),
                "agent connection"
            ),
        }
        Ok(())
    }
}

/// An event with the time it was observed.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    pub event: LifecycleEvent,
}

/// Keeps the most recent events in memory.
#[derive(Debug)]
pub struct EventRecorder {
    capacity: usize,
    events: Mutex<VecDeque<RecordedEvent>>,
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventRecorder {
    /// Create a recorder holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Count recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|r| predicate(&r.event)).count())
            .unwrap_or(0)
    }

    /// Count recorded events with the given name, e.g. `master.provisioning`.
    pub fn count_named(&self, name: &str) -> usize {
        self.count(|e| e.event_name() == name)
    }

    /// Master events for one organization, in order.
    pub fn master_events(&self, organization: &Organization) -> Vec<MasterEvent> {
        self.events
            .lock()
            .map(|e| {
                e.iter()
                    .filter_map(|r| match &r.event {
                        LifecycleEvent::Master(m) if m.organization() == organization => {
                            Some(m.clone())
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventListener for EventRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| ListenerError::Failed("Lock poisoned".into()))?;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(RecordedEvent {
            at: Utc::now(),
            event: event.clone(),
        });
        Ok(())
    }
}

/// Bridges synchronous delivery to async subscribers.
///
/// Slow subscribers lose the oldest events rather than slowing delivery.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event fired after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventListener for EventBus {
    fn name(&self) -> &str {
        "bus"
    }

    fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError> {
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
