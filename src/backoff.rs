//! Requeue backoff with jitter, and per-cluster failure tracking.
//!
//! The reconcile pass never retries internally; a failed pass is requeued by
//! the controller after a delay that grows with the number of consecutive
//! failures for that cluster. The count resets after a successful pass.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

use crate::document::ObjectKey;

/// Backoff settings for failed reconcile passes
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Consecutive failed passes after which the failure is surfaced on the
    /// cluster's status (0 = never)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config escalating after `attempts` consecutive failures
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay before the next pass after `failures` consecutive failures,
    /// without jitter
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before the next pass, with 0.5x to 1.5x jitter, capped at max_delay
    pub fn delay_for(&self, failures: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.base_delay(failures).as_secs_f64() * jitter);
        jittered.min(self.max_delay)
    }

    /// True once `failures` consecutive failures should be surfaced to users
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}

/// Consecutive failed passes per cluster
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: DashMap<ObjectKey, u32>,
}

impl FailureTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failed pass; returns the new consecutive count
    pub fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut entry = self.failures.entry(key.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    /// Forget failures after a successful pass
    pub fn reset(&self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures.get(key).map(|count| *count).unwrap_or(0)
    }
}
