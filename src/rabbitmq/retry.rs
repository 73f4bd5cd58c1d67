use std::time::Duration;

use super::options::RetryStrategy;

/// Delay before retry number `retry_count`, capped at `max`.
///
/// Products that overflow saturate to `max`.
pub fn retry_delay(
    strategy: RetryStrategy,
    base: Duration,
    max: Duration,
    retry_count: u32,
) -> Duration {
    let delay = match strategy {
        RetryStrategy::Fixed => Some(base),
        RetryStrategy::Linear => base.checked_mul(retry_count),
        RetryStrategy::Exponential => 2u32
            .checked_pow(retry_count)
            .and_then(|factor| base.checked_mul(factor)),
    };

    delay.unwrap_or(max).min(max)
}

/// Pause between failed consume cycles of one worker.
///
/// Starts at `min`, multiplies by `factor` on every failure up to `max`, and jumps
/// straight to `max` once `trip_after` failures have happened in a row. Owned by a
/// single worker task, so no locking.
#[derive(Debug, Clone)]
pub struct ConsumeBackoff {
    min: Duration,
    max: Duration,
    factor: u32,
    trip_after: u32,
    current: Duration,
    failures: u32,
}

impl Default for ConsumeBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2, 10)
    }
}

impl ConsumeBackoff {
    pub fn new(min: Duration, max: Duration, factor: u32, trip_after: u32) -> Self {
        Self {
            min,
            max,
            factor,
            trip_after,
            current: Duration::ZERO,
            failures: 0,
        }
    }

    /// Record a failed cycle and return how long to wait before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);

        self.current = if self.current.is_zero() {
            self.min
        } else {
            self.current
                .checked_mul(self.factor)
                .unwrap_or(self.max)
                .min(self.max)
        };

        if self.failures >= self.trip_after {
            self.current = self.max;
        }

        self.current
    }

    /// A consume cycle ended cleanly.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
        self.failures = 0;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}
