//! Time source for the scheduler

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

/// Where the scheduler gets the time from.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Resolve after `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Tokio's clock. Follows paused and advanced time in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to.
///
/// Sleepers wake once [`advance`](Self::advance) carries the time past
/// their deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (now, _) = watch::channel(Instant::now());
        Self { now }
    }

    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        let mut rx = self.now.subscribe();
        let deadline = *rx.borrow_and_update() + duration;
        let _ = rx.wait_for(|now| *now >= deadline).await;
    }
}
