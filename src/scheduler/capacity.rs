//! Per-backend capacity accounting

use serde::{Deserialize, Serialize};

/// In-flight starts against a backend's maximum. Owned by the scheduler
/// task, which is its only writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityCounter {
    max: usize,
    in_flight: usize,
    peak: usize,
}

impl CapacityCounter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            in_flight: 0,
            peak: 0,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Highest in-flight count seen.
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn has_room(&self) -> bool {
        self.in_flight < self.max
    }

    /// Take one slot. Returns `false` when full.
    pub fn try_reserve(&mut self) -> bool {
        if !self.has_room() {
            return false;
        }
        self.in_flight += 1;
        self.peak = self.peak.max(self.in_flight);
        true
    }

    /// Give one slot back. Returns `false` if nothing was reserved.
    pub fn release(&mut self) -> bool {
        match self.in_flight.checked_sub(1) {
            Some(n) => {
                self.in_flight = n;
                true
            }
            None => false,
        }
    }
}

/// Published view of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub capacity: usize,
    pub in_flight: usize,
    pub peak: usize,
    pub dispatched: u64,
    pub failures: u64,
}
