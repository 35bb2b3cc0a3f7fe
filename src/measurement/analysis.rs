//! Post-measurement analysis with limits.
//!
//! A measurement lists its analysis functions in the `analysis_functions` parameter,
//! either by name or as a table with parameters and limits:
//!
//! ```text
//! analysis_functions:
//!   - iv
//!   - type: iv
//!     limits:
//!       a: {minimum: 0.0, maximum: 1.0e-6}
//! ```
//!
//! Each function produces a named set of values which is stored in the measurement's
//! analysis data. A NaN or out-of-limit value is an analysis failure.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{MeasurementError, MeasurementResult};
use crate::parameter::ParameterValue;

/// Inclusive limits of one analysis value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limit {
    /// Lower bound
    pub minimum: Option<f64>,
    /// Upper bound
    pub maximum: Option<f64>,
}

/// Result of one analysis function: ordered named values.
pub type AnalysisResult = IndexMap<String, f64>;

/// Configured analysis function.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisFunction {
    /// Function type (`iv`, `cv`)
    pub type_name: String,
    /// Extra parameters
    pub parameters: IndexMap<String, ParameterValue>,
    /// Limits by result key
    pub limits: IndexMap<String, Limit>,
}

impl AnalysisFunction {
    /// Build from a parameter value: a bare name or a table with `type`.
    pub fn from_parameter(value: &ParameterValue) -> MeasurementResult<Self> {
        match value {
            ParameterValue::String(name) => Ok(Self {
                type_name: name.clone(),
                parameters: IndexMap::new(),
                limits: IndexMap::new(),
            }),
            ParameterValue::Table(table) => {
                let type_name = table
                    .get("type")
                    .and_then(ParameterValue::as_str)
                    .ok_or_else(|| MeasurementError::Analysis("Missing analysis key: type".into()))?
                    .to_string();
                let parameters = table
                    .get("parameters")
                    .and_then(ParameterValue::as_table)
                    .cloned()
                    .unwrap_or_default();
                let limits = table
                    .get("limits")
                    .and_then(ParameterValue::as_table)
                    .map(|limits| {
                        limits
                            .iter()
                            .map(|(key, limit)| (key.clone(), parse_limit(limit)))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Self {
                    type_name,
                    parameters,
                    limits,
                })
            }
            other => Err(MeasurementError::Analysis(format!(
                "Invalid analysis function: {other}"
            ))),
        }
    }

    /// Parse the `analysis_functions` parameter.
    pub fn from_list(value: &ParameterValue) -> MeasurementResult<Vec<Self>> {
        match value {
            ParameterValue::Array(items) => items.iter().map(Self::from_parameter).collect(),
            other => Ok(vec![Self::from_parameter(other)?]),
        }
    }

    /// Run the function on `(x, y)` data.
    pub fn call(&self, x: &[f64], y: &[f64]) -> MeasurementResult<AnalysisResult> {
        info!("Running analysis function {:?}...", self.type_name);
        let result = match self.type_name.as_str() {
            "iv" => analyse_iv(x, y),
            "cv" => analyse_cv(x, y),
            other => Err(MeasurementError::Analysis(format!(
                "No such analysis function: {other}"
            ))),
        }?;
        info!("Running analysis function {:?}... done.", self.type_name);
        Ok(result)
    }

    /// Check `result` against the limits.
    pub fn verify(&self, result: &AnalysisResult) -> MeasurementResult<()> {
        for (key, limit) in &self.limits {
            let Some(value) = result.get(key).copied() else {
                warn!("No such limit: {} for {}", key, self.type_name);
                continue;
            };
            if value.is_nan() {
                return Err(self.out_of_range(key, format!("{value}")));
            }
            if let Some(minimum) = limit.minimum {
                if value < minimum {
                    return Err(self.out_of_range(key, format!("{value} < {minimum}")));
                }
            }
            if let Some(maximum) = limit.maximum {
                if value > maximum {
                    return Err(self.out_of_range(key, format!("{value} > {maximum}")));
                }
            }
        }
        Ok(())
    }

    fn out_of_range(&self, key: &str, detail: String) -> MeasurementError {
        MeasurementError::Analysis(format!(
            "Out of range '{key}' for {}: {detail}",
            self.type_name
        ))
    }
}

fn parse_limit(value: &ParameterValue) -> Limit {
    let table = value.as_table();
    let bound = |name: &str| table.and_then(|t| t.get(name)).and_then(ParameterValue::as_f64);
    Limit {
        minimum: bound("minimum"),
        maximum: bound("maximum"),
    }
}

/// Least-squares line `y = a * x + b` with correlation coefficient.
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<(f64, f64, f64)> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = x[..n].iter().sum::<f64>() / nf;
    let mean_y = y[..n].iter().sum::<f64>() / nf;
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for (xi, yi) in x[..n].iter().zip(&y[..n]) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx == 0.0 {
        return None;
    }
    let a = sxy / sxx;
    let b = mean_y - a * mean_x;
    let r = if syy == 0.0 { 1.0 } else { sxy / (sxx * syy).sqrt() };
    Some((a, b, r))
}

/// IV analysis: slope, intercept and fit quality of current over voltage.
fn analyse_iv(v: &[f64], i: &[f64]) -> MeasurementResult<AnalysisResult> {
    let (a, b, r) = linear_fit(v, i).unwrap_or((f64::NAN, f64::NAN, f64::NAN));
    let i_max = i.iter().copied().fold(f64::NAN, |m, x| m.max(x.abs()));
    Ok(IndexMap::from([
        ("a".to_string(), a),
        ("b".to_string(), b),
        ("r_value".to_string(), r),
        ("i_max".to_string(), i_max),
    ]))
}

/// CV analysis: capacitance statistics.
fn analyse_cv(_v: &[f64], c: &[f64]) -> MeasurementResult<AnalysisResult> {
    let finite: Vec<f64> = c.iter().copied().filter(|x| x.is_finite()).collect();
    let mean = if finite.is_empty() {
        f64::NAN
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    };
    let c_min = finite.iter().copied().fold(f64::NAN, f64::min);
    let c_max = finite.iter().copied().fold(f64::NAN, f64::max);
    Ok(IndexMap::from([
        ("c_mean".to_string(), mean),
        ("c_min".to_string(), c_min),
        ("c_max".to_string(), c_max),
    ]))
}

/// Convert a result into a JSON object for the analysis data.
pub fn result_to_value(result: &AnalysisResult) -> Value {
    Value::Object(
        result
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, ParameterValue)]) -> ParameterValue {
        ParameterValue::Table(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn parse_name_and_table() {
        let list = ParameterValue::Array(vec![
            "iv".into(),
            table(&[
                ("type", "cv".into()),
                (
                    "limits",
                    table(&[("c_mean", table(&[("minimum", 1.0.into()), ("maximum", 2.into())]))]),
                ),
            ]),
        ]);
        let functions = AnalysisFunction::from_list(&list).unwrap();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].type_name, "iv");
        assert_eq!(
            functions[1].limits["c_mean"],
            Limit {
                minimum: Some(1.0),
                maximum: Some(2.0)
            }
        );
        assert!(AnalysisFunction::from_parameter(&table(&[])).is_err());
    }

    #[test]
    fn linear_fit_of_ohmic_load() {
        let v = [0.0, 2.0, 4.0, 6.0];
        let i: Vec<f64> = v.iter().map(|v| v * 1e-9 + 1e-12).collect();
        let (a, b, r) = linear_fit(&v, &i).unwrap();
        assert!((a - 1e-9).abs() < 1e-18);
        assert!((b - 1e-12).abs() < 1e-18);
        assert!((r - 1.0).abs() < 1e-9);
        assert!(linear_fit(&[1.0], &[1.0]).is_none());
    }

    #[test]
    fn verify_limits() {
        let mut f = AnalysisFunction::from_parameter(&"iv".into()).unwrap();
        f.limits.insert(
            "a".into(),
            Limit {
                minimum: None,
                maximum: Some(1e-9),
            },
        );
        let ok = f.call(&[0.0, 1.0], &[0.0, 5e-10]).unwrap();
        assert!(f.verify(&ok).is_ok());
        let high = f.call(&[0.0, 1.0], &[0.0, 5e-9]).unwrap();
        assert!(matches!(f.verify(&high), Err(MeasurementError::Analysis(_))));
        let nan = f.call(&[1.0, 1.0], &[0.0, 5e-9]).unwrap();
        assert!(f.verify(&nan).is_err());
    }

    #[test]
    fn unknown_function_is_analysis_error() {
        let f = AnalysisFunction::from_parameter(&"frequency".into()).unwrap();
        assert!(matches!(
            f.call(&[0.0, 1.0], &[0.0, 1.0]),
            Err(MeasurementError::Analysis(_))
        ));
    }
}
