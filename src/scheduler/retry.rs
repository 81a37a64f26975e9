//! # Retry Policy
//!
//! Bounded exponential backoff for failed starts. Defaults: 3 attempts in
//! total, 500 ms doubling up to 30 s, with ±10 % jitter. A transient
//! failure is always retried at least once.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::{SchedulerError, SchedulerResult};
use crate::backend::BackendError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total starts attempted before giving up, first one included.
    /// At least 2.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the backoff added or removed at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_attempts < 2 {
            return Err(SchedulerError::InvalidRetryPolicy(
                "max_attempts must be at least 2".into(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(SchedulerError::InvalidRetryPolicy(
                "multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(SchedulerError::InvalidRetryPolicy(
                "jitter must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Whether another start may follow `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32, error: &BackendError) -> bool {
        error.is_transient() && attempts < self.max_attempts
    }

    /// Delay before the start following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}
