//! Timing instrumentation for repeated instrument operations.

use std::fmt;
use std::time::{Duration, Instant};

/// Collects durations of a named, repeated operation.
///
/// ```
/// use rust_pqc::utils::Benchmark;
///
/// let mut bench = Benchmark::new("Read_HVSrc");
/// let reading = bench.measure(|| 42.0);
/// assert_eq!(reading, 42.0);
/// assert_eq!(bench.count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Benchmark {
    name: String,
    history: Vec<Duration>,
}

impl Benchmark {
    /// Create an empty benchmark.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history: Vec::new(),
        }
    }

    /// Time a synchronous closure.
    pub fn measure<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let t0 = Instant::now();
        let value = f();
        self.record(t0.elapsed());
        value
    }

    /// Time a future.
    pub async fn measure_async<T, F>(&mut self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let t0 = Instant::now();
        let value = fut.await;
        self.record(t0.elapsed());
        value
    }

    /// Append one sample.
    pub fn record(&mut self, delta: Duration) {
        self.history.push(delta);
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Recorded samples.
    pub fn history(&self) -> &[Duration] {
        &self.history
    }

    /// Number of samples.
    pub fn count(&self) -> usize {
        self.history.len()
    }

    /// Mean duration, zero without samples.
    pub fn average(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        self.history.iter().sum::<Duration>() / self.history.len() as u32
    }

    /// Shortest sample, zero without samples.
    pub fn minimum(&self) -> Duration {
        self.history.iter().min().copied().unwrap_or_default()
    }

    /// Longest sample, zero without samples.
    pub fn maximum(&self) -> Duration {
        self.history.iter().max().copied().unwrap_or_default()
    }
}

impl fmt::Display for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Benchmark[{}](n={}, avg={:.6}s, min={:.6}s, max={:.6}s)",
            self.name,
            self.count(),
            self.average().as_secs_f64(),
            self.minimum().as_secs_f64(),
            self.maximum().as_secs_f64()
        )
    }
}
