//! Progress tracking for stitch workers.

use std::time::{Duration, Instant};

/// Processed-message counter with a remaining-time projection.
#[derive(Debug, Clone)]
pub struct Progress {
    expected: usize,
    processed: usize,
    started: Instant,
}

/// Point-in-time view of a [`Progress`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub processed: usize,
    pub expected: usize,
    /// Messages per second since start.
    pub rate: f64,
    /// Projected time to process the remaining messages.
    pub remaining: Option<Duration>,
}

impl ProgressSnapshot {
    /// Completed fraction in percent, or 0 with nothing expected.
    pub fn percent(&self) -> f64 {
        if self.expected == 0 {
            0.0
        } else {
            100.0 * self.processed as f64 / self.expected as f64
        }
    }
}

impl Progress {
    pub fn new(expected: usize) -> Self {
        Self::starting_at(expected, Instant::now())
    }

    pub fn starting_at(expected: usize, started: Instant) -> Self {
        Self {
            expected,
            processed: 0,
            started,
        }
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Adds `units` processed messages and returns the updated snapshot.
    pub fn record(&mut self, units: usize) -> ProgressSnapshot {
        self.processed += units;
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.processed as f64 / elapsed
        } else {
            0.0
        };
        let left = self.expected.saturating_sub(self.processed);
        let remaining = (rate > 0.0).then(|| Duration::from_secs_f64(left as f64 / rate));
        ProgressSnapshot {
            processed: self.processed,
            expected: self.expected,
            rate,
            remaining,
        }
    }
}
