//! Retry Policy
//!
//! Fixed-interval polling with optional jitter, built on `backoff` and
//! sleeping on the tokio timer so tests can run it under paused time.

use crate::error::Result;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How often and how long to poll for a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of probes before giving up
    pub max_attempts: u32,
    /// Delay before each probe, in milliseconds
    pub interval_ms: u64,
    /// Randomization factor applied to the interval (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::path_health()
    }
}

impl RetryPolicy {
    /// Policy for a newly created replication path: 4 probes, 2s apart
    pub fn path_health() -> Self {
        Self {
            max_attempts: 4,
            interval_ms: 2000,
            jitter: 0.0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Backoff schedule for this policy
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.interval())
            .with_max_interval(self.interval())
            .with_multiplier(1.0)
            .with_randomization_factor(self.jitter.clamp(0.0, 1.0))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Sleep, then probe, up to `max_attempts` times.
    ///
    /// Returns `Ok(true)` as soon as a probe reports ready, `Ok(false)` when
    /// every attempt was used. Probe errors abort the loop.
    pub async fn poll_until<F, Fut>(&self, mut probe: F) -> Result<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut schedule = self.backoff();

        for attempt in 1..=self.max_attempts {
            let delay = schedule.next_backoff().unwrap_or_else(|| self.interval());
            tokio::time::sleep(delay).await;

            if probe().await? {
                debug!("Condition met after {} attempt(s)", attempt);
                return Ok(true);
            }
            debug!("Attempt {}/{} not ready", attempt, self.max_attempts);
        }

        Ok(false)
    }
}
