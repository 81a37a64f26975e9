//! # Reconciliation Cadence
//!
//! Initial delay before the first pass and period between passes. Both are
//! settable at runtime through a [`CadenceHandle`]; the scheduler picks up
//! changes without restarting.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::errors::{SchedulerError, SchedulerResult};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RECURRENCE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    pub initial_delay: Duration,
    pub recurrence_period: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            recurrence_period: DEFAULT_RECURRENCE_PERIOD,
        }
    }
}

impl Cadence {
    pub fn new(initial_delay: Duration, recurrence_period: Duration) -> SchedulerResult<Self> {
        let cadence = Self {
            initial_delay,
            recurrence_period,
        };
        cadence.validate()?;
        Ok(cadence)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.recurrence_period.is_zero() {
            return Err(SchedulerError::InvalidCadence(
                "recurrence period must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Shared, runtime-settable cadence.
#[derive(Debug, Clone)]
pub struct CadenceHandle {
    tx: Arc<watch::Sender<Cadence>>,
}

impl CadenceHandle {
    pub fn new(cadence: Cadence) -> Self {
        let (tx, _) = watch::channel(cadence);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Cadence {
        *self.tx.borrow()
    }

    pub fn set(&self, cadence: Cadence) -> SchedulerResult<()> {
        cadence.validate()?;
        self.tx.send_replace(cadence);
        Ok(())
    }

    pub fn set_initial_delay(&self, delay: Duration) -> SchedulerResult<()> {
        self.set(Cadence {
            initial_delay: delay,
            ..self.get()
        })
    }

    pub fn set_recurrence_period(&self, period: Duration) -> SchedulerResult<()> {
        self.set(Cadence {
            recurrence_period: period,
            ..self.get()
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Cadence> {
        self.tx.subscribe()
    }
}
