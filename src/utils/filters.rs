//! Reading filters.

/// True if sample standard deviation divided by mean is below `threshold`.
///
/// Fewer than two values never pass.
pub fn std_mean_filter(values: &[f64], threshold: f64) -> bool {
    if values.len() < 2 {
        return false;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt() / mean < threshold
}
