//! Linear voltage ramps.

/// Inclusive linear range from `begin` to `end`.
///
/// - The sign of `step` is ignored; the direction follows `end - begin`.
/// - A step larger than the distance is limited to the distance.
/// - `begin == end` yields the single value `begin`.
/// - The range is empty if `step == 0` and the bounds differ.
/// - The last value is exactly `end`, even if the distance is not a multiple of the step.
///
/// ```
/// use rust_pqc::utils::LinearRange;
///
/// let values: Vec<f64> = LinearRange::new(5.0, 0.0, 2.5).collect();
/// assert_eq!(values, vec![5.0, 2.5, 0.0]);
/// ```
#[derive(Debug, Clone)]
pub struct LinearRange {
    begin: f64,
    end: f64,
    step: f64,
    count: usize,
    index: usize,
}

impl LinearRange {
    /// Create a range.
    pub fn new(begin: f64, end: f64, step: f64) -> Self {
        let distance = (end - begin).abs();
        let (step, count) = if distance == 0.0 {
            (0.0, 1)
        } else if step == 0.0 || !step.is_finite() {
            (0.0, 0)
        } else {
            let step_abs = step.abs().min(distance);
            let intervals = ((distance / step_abs) - 1e-9).ceil().max(1.0) as usize;
            (step_abs.copysign(end - begin), intervals + 1)
        };
        Self {
            begin,
            end,
            step,
            count,
            index: 0,
        }
    }

    /// First value.
    pub fn begin(&self) -> f64 {
        self.begin
    }

    /// Last value.
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Effective signed step (zero for empty ranges).
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Total number of values.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Iterator for LinearRange {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.index >= self.count {
            return None;
        }
        let value = if self.index + 1 == self.count {
            self.end
        } else {
            self.begin + self.step * self.index as f64
        };
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for LinearRange {}

/// Step size for safely ramping a source at `voltage` down to zero.
pub fn safe_ramp_step(voltage: f64) -> f64 {
    (voltage.abs() / 100.0).clamp(5.0, 25.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(begin: f64, end: f64, step: f64) -> Vec<f64> {
        LinearRange::new(begin, end, step).collect()
    }

    #[test]
    fn empty_ranges() {
        assert!(range(0.0, 1.0, 0.0).is_empty());
        assert!(range(1.0, 0.0, f64::NAN).is_empty());
    }

    #[test]
    fn equal_bounds_yield_one_value() {
        assert_eq!(range(5.0, 5.0, 2.5), vec![5.0]);
        assert_eq!(range(-1.0, -1.0, -1.0), vec![-1.0]);
        assert_eq!(range(0.0, 0.0, 0.0), vec![0.0]);
        let single = LinearRange::new(5.0, 5.0, 2.5);
        assert_eq!(LinearRange::count(&single), 1);
        assert_eq!(single.step(), 0.0);
    }

    #[test]
    fn auto_step_direction() {
        assert_eq!(range(1.0, 0.0, 1.0), vec![1.0, 0.0]);
        assert_eq!(range(0.0, -5.0, 2.5), vec![0.0, -2.5, -5.0]);
        assert_eq!(range(0.0, 5.0, -2.5), vec![0.0, 2.5, 5.0]);
        assert_eq!(range(2.5, -2.5, 2.5), vec![2.5, 0.0, -2.5]);
        assert_eq!(range(-2.5e-12, 2.5e-12, 2.5e-12), vec![-2.5e-12, 0.0, 2.5e-12]);
    }

    #[test]
    fn step_limited_to_distance() {
        assert_eq!(range(0.0, 1.0, 5.0), vec![0.0, 1.0]);
        assert_eq!(range(1.0, 0.0, 5.0), vec![1.0, 0.0]);
        assert_eq!(range(0.0, 1.0, 2.0), vec![0.0, 1.0]);
    }

    #[test]
    fn last_value_is_end() {
        assert_eq!(range(0.0, 10.0, 3.0), vec![0.0, 3.0, 6.0, 9.0, 10.0]);
        assert_eq!(range(0.0, 10.0, 2.0), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_eq!(LinearRange::new(0.0, 10.0, 2.0).count(), 6);
    }

    #[test]
    fn safe_step_is_clamped() {
        assert_eq!(safe_ramp_step(100.0), 5.0);
        assert_eq!(safe_ramp_step(-1000.0), 10.0);
        assert_eq!(safe_ramp_step(5000.0), 25.0);
    }
}
