//! Progress and remaining-time estimation for ramps.

use std::fmt;
use std::time::{Duration, Instant};

/// Tracks how many of `count` steps have passed and extrapolates the remaining time.
#[derive(Debug, Clone)]
pub struct Estimate {
    count: usize,
    passed: usize,
    start: Instant,
}

impl Estimate {
    /// Start an estimate for `count` steps.
    pub fn new(count: usize) -> Self {
        Self {
            count,
            passed: 0,
            start: Instant::now(),
        }
    }

    /// Total number of steps.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Steps passed so far.
    pub fn passed(&self) -> usize {
        self.passed
    }

    /// Mark one step as passed.
    pub fn advance(&mut self) {
        self.passed += 1;
    }

    /// `(passed, count)` for progress reporting.
    pub fn progress(&self) -> (usize, usize) {
        (self.passed, self.count)
    }

    /// Time since the estimate was started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Average time per passed step.
    pub fn average(&self) -> Duration {
        if self.passed == 0 {
            return Duration::ZERO;
        }
        self.elapsed() / self.passed as u32
    }

    /// Extrapolated time for the remaining steps.
    pub fn remaining(&self) -> Duration {
        let left = self.count.saturating_sub(self.passed) as u32;
        self.average() * left
    }
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Elapsed {}s | Remaining {}s",
            self.elapsed().as_secs(),
            self.remaining().as_secs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_past_total() {
        let mut est = Estimate::new(42);
        assert_eq!(est.count(), 42);
        assert_eq!(est.progress(), (0, 42));
        for i in 0..=est.count() {
            est.advance();
            assert_eq!(est.progress(), (i + 1, 42));
        }
        assert_eq!(est.remaining(), Duration::ZERO);
    }

    #[test]
    fn no_average_before_first_step() {
        let est = Estimate::new(3);
        assert_eq!(est.average(), Duration::ZERO);
        assert_eq!(est.remaining(), Duration::ZERO);
    }
}
