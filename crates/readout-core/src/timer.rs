//! Drift-free periodic timer.
//!
//! Drives the software timeframe clock, the dropped-packet audit cadence and
//! the monitoring update period. `increment` advances the deadline by whole
//! intervals from the previous deadline (not from "now"), so a late check
//! does not accumulate drift.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    interval: Duration,
    deadline: Instant,
}

impl PeriodicTimer {
    /// Timer whose first timeout is one interval from now.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + interval,
        }
    }

    /// True once the current deadline has passed.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Advance the deadline by one interval, keeping the original phase.
    pub fn increment(&mut self) {
        self.deadline += self.interval;
        // If we fell far behind, skip missed periods instead of firing a
        // burst of catch-up timeouts.
        let now = Instant::now();
        if self.deadline < now {
            let behind = now.duration_since(self.deadline);
            let missed = behind.as_nanos() / self.interval.as_nanos().max(1) + 1;
            self.deadline += self.interval * missed as u32;
        }
    }

    /// Restart with a new interval, first timeout one interval from now.
    pub fn reset(&mut self, interval: Duration) {
        self.interval = interval;
        self.deadline = Instant::now() + interval;
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}
