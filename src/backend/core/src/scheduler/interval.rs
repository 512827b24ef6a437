//! Adaptive poll interval.

use std::time::Duration;

/// Poll interval that tracks backlog.
///
/// A full batch suggests more work is waiting, so the interval halves toward
/// `min`. An empty batch, or one under a quarter full, doubles it toward
/// `max`. Anything in between keeps the current interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollInterval {
    current: Duration,
    min: Duration,
    max: Duration,
    batch_size: usize,
}

impl PollInterval {
    /// Starts at `min`.
    pub fn new(min: Duration, max: Duration, batch_size: usize) -> Self {
        let max = max.max(min);
        Self {
            current: min,
            min,
            max,
            batch_size,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Adjust after a batch of `claimed` events. Returns the next interval.
    pub fn observe(&mut self, claimed: usize) -> Duration {
        if self.batch_size > 0 && claimed >= self.batch_size {
            self.shrink();
        } else if claimed == 0 || claimed < self.batch_size / 4 {
            self.grow();
        }
        self.current
    }

    /// Back off after a cycle that could not run (no leases, escalation).
    pub fn back_off(&mut self) -> Duration {
        self.grow();
        self.current
    }

    fn shrink(&mut self) {
        self.current = (self.current / 2).max(self.min);
    }

    fn grow(&mut self) {
        let doubled = self.current.saturating_mul(2).max(Duration::from_millis(1));
        self.current = doubled.clamp(self.min, self.max);
    }
}
