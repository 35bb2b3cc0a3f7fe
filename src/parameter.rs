//! Measurement parameters.
//!
//! Every measurement type registers the parameters it understands once, with a default,
//! an optional unit, an optional enumeration of allowed values and a required flag.
//! Values supplied by the sequence are resolved against these registrations:
//!
//! ```rust,ignore
//! let mut store = ParameterStore::new(node.parameters.clone());
//! store.register(ParameterSpec::new("voltage_start").unit("V").required())?;
//! store.register(ParameterSpec::new("waiting_time").default(1.0).unit("s"))?;
//!
//! let start = store.get_f64("voltage_start")?; // "-10 V" -> -10.0
//! let wait = store.get_f64("waiting_time")?;   // not supplied -> 1.0
//! ```

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ParameterError;
use crate::units::Quantity;

/// Ordered mapping of parameter names to values.
pub type ParameterMap = IndexMap<String, ParameterValue>;

/// A parameter value as found in a sequence definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Float value
    Float(f64),
    /// String value, possibly carrying a unit (`"10 V"`)
    String(String),
    /// Array of values
    Array(Vec<ParameterValue>),
    /// Nested table
    Table(IndexMap<String, ParameterValue>),
}

impl ParameterValue {
    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Integer(v) => Some(*v),
            ParameterValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// Get as float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Vec<ParameterValue>> {
        match self {
            ParameterValue::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Get as table
    pub fn as_table(&self) -> Option<&IndexMap<String, ParameterValue>> {
        match self {
            ParameterValue::Table(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{v}"),
            ParameterValue::Integer(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::String(v) => write!(f, "{v}"),
            ParameterValue::Array(items) => {
                let items: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
            ParameterValue::Table(table) => {
                let items: Vec<String> =
                    table.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Integer(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        ParameterValue::Integer(v as i64)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::String(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::String(v.to_string())
    }
}

impl From<Vec<ParameterValue>> for ParameterValue {
    fn from(v: Vec<ParameterValue>) -> Self {
        ParameterValue::Array(v)
    }
}

/// Registration of a single parameter.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    /// Parameter name
    pub key: String,
    /// Value used when the sequence does not supply one
    pub default: Option<ParameterValue>,
    /// Target unit; resolved values are converted to it
    pub unit: Option<String>,
    /// Allowed values (enumeration constraint)
    pub values: Option<Vec<ParameterValue>>,
    /// Whether the sequence must supply a value
    pub required: bool,
}

impl ParameterSpec {
    /// Start a registration for `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            default: None,
            unit: None,
            values: None,
            required: false,
        }
    }

    /// Set the default value.
    pub fn default(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the target unit.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Restrict to an enumeration of values.
    pub fn values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParameterValue>,
    {
        self.values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Mark the parameter as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Registered parameters of one measurement together with the supplied values.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    specs: IndexMap<String, ParameterSpec>,
    values: ParameterMap,
}

impl ParameterStore {
    /// Create a store over the values supplied by the sequence.
    pub fn new(values: ParameterMap) -> Self {
        Self {
            specs: IndexMap::new(),
            values,
        }
    }

    /// Register a parameter. Each key may be registered once.
    pub fn register(&mut self, spec: ParameterSpec) -> Result<(), ParameterError> {
        if self.specs.contains_key(&spec.key) {
            return Err(ParameterError::Duplicate(spec.key));
        }
        self.specs.insert(spec.key.clone(), spec);
        Ok(())
    }

    /// Registered specs in registration order.
    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.specs.values()
    }

    /// Values supplied by the sequence.
    pub fn supplied(&self) -> &ParameterMap {
        &self.values
    }

    /// Warn about supplied keys that were never registered and return them.
    pub fn validate_parameters(&self) -> Vec<String> {
        let unknown: Vec<String> = self
            .values
            .keys()
            .filter(|key| !self.specs.contains_key(*key))
            .cloned()
            .collect();
        for key in &unknown {
            warn!(parameter = %key, "Unknown parameter");
        }
        unknown
    }

    /// Resolve `key` to a value: supplied value or default, converted to the
    /// registered unit and checked against the enumeration.
    pub fn resolve(&self, key: &str) -> Result<ParameterValue, ParameterError> {
        let spec = self
            .specs
            .get(key)
            .ok_or_else(|| ParameterError::Unregistered(key.to_string()))?;

        let raw = match self.values.get(key) {
            Some(value) => value.clone(),
            None if spec.required => return Err(ParameterError::Missing(key.to_string())),
            None => spec
                .default
                .clone()
                .ok_or_else(|| ParameterError::Missing(key.to_string()))?,
        };

        let value = match &spec.unit {
            Some(unit) => ParameterValue::Float(convert_unit(key, &raw, unit)?),
            None => raw,
        };

        if let Some(allowed) = &spec.values {
            if !allowed.contains(&value) {
                let allowed: Vec<String> = allowed.iter().map(ToString::to_string).collect();
                return Err(ParameterError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    allowed: allowed.join(", "),
                });
            }
        }

        Ok(value)
    }

    /// Resolve as a float (unit-converted if a unit is registered).
    pub fn get_f64(&self, key: &str) -> Result<f64, ParameterError> {
        self.resolve(key)?
            .as_f64()
            .ok_or_else(|| invalid_type(key, "number"))
    }

    /// Resolve as an integer.
    pub fn get_i64(&self, key: &str) -> Result<i64, ParameterError> {
        self.resolve(key)?
            .as_i64()
            .ok_or_else(|| invalid_type(key, "integer"))
    }

    /// Resolve as a boolean.
    pub fn get_bool(&self, key: &str) -> Result<bool, ParameterError> {
        self.resolve(key)?
            .as_bool()
            .ok_or_else(|| invalid_type(key, "bool"))
    }

    /// Resolve as a string.
    pub fn get_string(&self, key: &str) -> Result<String, ParameterError> {
        match self.resolve(key)? {
            ParameterValue::String(s) => Ok(s),
            _ => Err(invalid_type(key, "string")),
        }
    }
}

fn invalid_type(key: &str, expected: &'static str) -> ParameterError {
    ParameterError::InvalidType {
        key: key.to_string(),
        expected,
    }
}

/// Convert a raw value to `unit`. Bare numbers are taken as already being in `unit`.
fn convert_unit(key: &str, raw: &ParameterValue, unit: &str) -> Result<f64, ParameterError> {
    let conversion_error = |from: String| ParameterError::UnitConversion {
        key: key.to_string(),
        from,
        to: unit.to_string(),
    };
    match raw {
        ParameterValue::Float(v) => Ok(*v),
        ParameterValue::Integer(v) => Ok(*v as f64),
        ParameterValue::String(text) => Quantity::parse(text)
            .and_then(|q| q.to(unit))
            .ok_or_else(|| conversion_error(text.clone())),
        other => Err(conversion_error(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(values: &[(&str, ParameterValue)]) -> ParameterStore {
        ParameterStore::new(
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut s = store(&[]);
        s.register(ParameterSpec::new("a").default(1.0)).unwrap();
        assert_eq!(
            s.register(ParameterSpec::new("a").default(2.0)),
            Err(ParameterError::Duplicate("a".into()))
        );
    }

    #[test]
    fn required_without_value_is_missing() {
        let mut s = store(&[]);
        s.register(ParameterSpec::new("voltage_start").unit("V").required())
            .unwrap();
        assert_eq!(
            s.get_f64("voltage_start"),
            Err(ParameterError::Missing("voltage_start".into()))
        );
    }

    #[test]
    fn optional_without_value_returns_default() {
        let mut s = store(&[]);
        s.register(ParameterSpec::new("mode").default("rear")).unwrap();
        assert_eq!(s.resolve("mode").unwrap(), ParameterValue::from("rear"));
    }

    #[test]
    fn unit_conversion() {
        let mut s = store(&[
            ("voltage", "1000 mV".into()),
            ("frequency", "1 kHz".into()),
            ("bare", 2.5.into()),
        ]);
        s.register(ParameterSpec::new("voltage").unit("V")).unwrap();
        s.register(ParameterSpec::new("frequency").unit("V")).unwrap();
        s.register(ParameterSpec::new("bare").unit("V")).unwrap();
        s.register(ParameterSpec::new("delay").default("100 ms").unit("s"))
            .unwrap();

        assert!((s.get_f64("voltage").unwrap() - 1.0).abs() < 1e-12);
        assert!(matches!(
            s.get_f64("frequency"),
            Err(ParameterError::UnitConversion { .. })
        ));
        assert_eq!(s.get_f64("bare").unwrap(), 2.5);
        assert!((s.get_f64("delay").unwrap() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn enumeration_constraint() {
        let mut s = store(&[("sense", "remote".into()), ("filter", "moving".into())]);
        s.register(ParameterSpec::new("sense").values(["local", "remote"]))
            .unwrap();
        s.register(ParameterSpec::new("filter").values(["repeat", "median"]))
            .unwrap();
        assert_eq!(s.get_string("sense").unwrap(), "remote");
        assert!(matches!(
            s.get_string("filter"),
            Err(ParameterError::InvalidValue { .. })
        ));
    }

    #[test]
    #[tracing_test::traced_test]
    fn unknown_keys_are_reported_not_rejected() {
        let mut s = store(&[("known", 1.into()), ("typo", 2.into())]);
        s.register(ParameterSpec::new("known").default(0)).unwrap();
        assert_eq!(s.validate_parameters(), vec!["typo".to_string()]);
        assert!(logs_contain("Unknown parameter"));
        assert_eq!(s.get_i64("known").unwrap(), 1);
    }

    #[test]
    fn untagged_deserialization() {
        let map: ParameterMap =
            serde_json::from_str(r#"{"a": true, "b": 3, "c": 0.5, "d": "5 V", "e": [1, 2]}"#)
                .unwrap();
        assert_eq!(map["a"], ParameterValue::Bool(true));
        assert_eq!(map["b"], ParameterValue::Integer(3));
        assert_eq!(map["c"], ParameterValue::Float(0.5));
        assert_eq!(map["d"].as_str(), Some("5 V"));
        assert_eq!(map["e"].as_array().map(Vec::len), Some(2));
    }
}
