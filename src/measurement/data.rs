//! Runtime data of a measurement: meta data, series and analysis results.
//!
//! Series are column-oriented. `append_series` adds one row and requires exactly the
//! registered key set, so all columns always have the same length. A rejected row leaves
//! every column untouched.

use std::fmt::Write as _;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeasurementError, MeasurementResult};

/// Ordered mapping for meta data and analysis results.
pub type ValueMap = IndexMap<String, Value>;

/// Data collected by one measurement run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementData {
    /// Run meta data (sample, contact, timestamps, parameters)
    pub meta: ValueMap,
    /// Unit of each series
    pub series_units: IndexMap<String, String>,
    /// Column data, all columns of equal length
    #[serde(with = "nan_as_null")]
    pub series: IndexMap<String, Vec<f64>>,
    /// Analysis results keyed by analysis type
    pub analysis: ValueMap,
}

impl MeasurementData {
    /// Drop everything.
    pub fn clear(&mut self) {
        self.meta.clear();
        self.series_units.clear();
        self.series.clear();
        self.analysis.clear();
    }

    /// Set a meta value.
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.meta.insert(key.into(), value.into());
    }

    /// Set the unit of a series.
    pub fn set_series_unit(&mut self, key: impl Into<String>, unit: impl Into<String>) {
        self.series_units.insert(key.into(), unit.into());
    }

    /// Register an empty series column.
    pub fn register_series(&mut self, key: impl Into<String>) {
        self.series.entry(key.into()).or_default();
    }

    /// Append one row. The keys must match the registered series exactly.
    pub fn append_series(&mut self, row: &[(&str, f64)]) -> MeasurementResult<()> {
        let matches = row.len() == self.series.len()
            && row.iter().all(|(key, _)| self.series.contains_key(*key))
            && row
                .iter()
                .enumerate()
                .all(|(i, (key, _))| row[..i].iter().all(|(other, _)| other != key));
        if !matches {
            let expected: Vec<&str> = self.series.keys().map(String::as_str).collect();
            let got: Vec<&str> = row.iter().map(|(key, _)| *key).collect();
            return Err(MeasurementError::Series {
                expected: expected.join(", "),
                got: got.join(", "),
            });
        }
        for (key, value) in row {
            if let Some(column) = self.series.get_mut(*key) {
                column.push(*value);
            }
        }
        Ok(())
    }

    /// Column `key`, empty if not registered.
    pub fn get_series(&self, key: &str) -> &[f64] {
        self.series.get(key).map_or(&[], Vec::as_slice)
    }

    /// Number of rows.
    pub fn series_len(&self) -> usize {
        self.series.values().next().map_or(0, Vec::len)
    }

    /// Store an analysis result.
    pub fn set_analysis(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.analysis.insert(key.into(), value.into());
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse JSON written by [`MeasurementData::to_json`].
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Plain-text table: meta lines, a header row and one row per index.
    pub fn to_txt(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.meta {
            let _ = writeln!(out, "{key}: {}", meta_text(value));
        }
        let header: Vec<String> = self
            .series
            .keys()
            .map(|key| match self.series_units.get(key) {
                Some(unit) => format!("{key}[{unit}]"),
                None => key.clone(),
            })
            .collect();
        let _ = writeln!(out, "{}", header.join("\t"));
        for index in 0..self.series_len() {
            let row: Vec<String> = self
                .series
                .values()
                .map(|column| column.get(index).copied().map_or_else(String::new, format_e))
                .collect();
            let _ = writeln!(out, "{}", row.join("\t"));
        }
        out
    }
}

/// Text form of a meta value: lists joined by `, `, strings unquoted.
fn meta_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(meta_text).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// Scientific notation with six decimals and a signed two-digit exponent (`1.000000E+00`).
pub fn format_e(value: f64) -> String {
    if value.is_nan() {
        return "NAN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    let text = format!("{value:.6E}");
    match text.split_once('E') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}E{sign}{:02}", exponent.abs())
        }
        None => text,
    }
}

/// Non-finite floats are written as `null` and read back as NaN.
mod nan_as_null {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(series: &IndexMap<String, Vec<f64>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mapped: IndexMap<&str, Vec<Option<f64>>> = series
            .iter()
            .map(|(key, column)| {
                let column = column.iter().map(|v| v.is_finite().then_some(*v)).collect();
                (key.as_str(), column)
            })
            .collect();
        mapped.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<IndexMap<String, Vec<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = IndexMap::<String, Vec<Option<f64>>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(key, column)| {
                let column = column.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                (key, column)
            })
            .collect())
    }
}
